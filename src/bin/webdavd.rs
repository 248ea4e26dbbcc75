//! Server (parent process) entry point: loads configuration, brings up the
//! RAP pool's background tasks, and serves every configured `<listen>`
//! block (spec §2, §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use webdavd::accesslog::AccessLog;
use webdavd::config::ServerConfig;
use webdavd::errorpages::StaticPages;
use webdavd::pool::RapPool;
use webdavd::server::{daemon, ServerContext};
use webdavd::tls::CertStore;

#[derive(Parser, Debug)]
#[command(name = "webdavd", about = "Privilege-separated WebDAV/HTTP(S) server")]
struct Args {
    /// Path to the server-config XML document.
    #[arg(short, long, default_value = "/etc/webdavd/config.xml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match ServerConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("could not load config from {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let cert_store = if config.ssl_certs.is_empty() {
        None
    } else {
        match CertStore::load(&config.ssl_certs) {
            Ok(store) if !store.is_empty() => Some(Arc::new(store)),
            Ok(_) => None,
            Err(e) => {
                log::error!("could not load ssl certificates: {e}");
                return ExitCode::FAILURE;
            }
        }
    };

    let access_log = match AccessLog::open(&config.access_log) {
        Ok(a) => a,
        Err(e) => {
            log::error!("could not open access log {}: {e}", config.access_log.display());
            return ExitCode::FAILURE;
        }
    };

    let pool = RapPool::new(
        config.rap_binary.clone(),
        config.pam_service.clone(),
        config.mime_file.clone(),
        config.max_user_sessions,
        Duration::from_secs(config.session_timeout_secs),
    );

    tokio::spawn(pool.clone().run_janitor());
    tokio::spawn(async {
        if let Err(e) = RapPool::reap_children().await {
            log::error!("SIGCHLD handler failed: {e}");
        }
    });

    let ctx = Arc::new(ServerContext {
        pool,
        pages: StaticPages::default(),
        access_log,
    });

    if let Err(e) = daemon::run(ctx, &config, cert_store).await {
        log::error!("server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
