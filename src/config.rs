//! Server configuration: `<server-config>` XML document (spec §6).

use std::path::{Path, PathBuf};

use xmltree::Element;

use crate::errors::ConfigError;

const CONFIG_NAMESPACE: &str = "http://couling.me/webdavd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    None,
    Ssl,
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub port: u16,
    pub host: Option<String>,
    pub encryption: Encryption,
}

#[derive(Debug, Clone)]
pub struct SslCertConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub chain: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Vec<ListenConfig>,
    /// Seconds a RAP may sit idle before the janitor reaps it
    /// (`rap_max_session_life`).
    pub session_timeout_secs: u64,
    /// `rap_max_sessions_per_user`.
    pub max_user_sessions: u32,
    pub restricted_user: Option<String>,
    pub mime_file: PathBuf,
    pub rap_binary: PathBuf,
    pub pam_service: String,
    pub access_log: PathBuf,
    pub error_log: PathBuf,
    pub ssl_certs: Vec<SslCertConfig>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen: Vec::new(),
            session_timeout_secs: 60 * 5,
            max_user_sessions: 10,
            restricted_user: None,
            mime_file: PathBuf::from("/etc/mime.types"),
            rap_binary: PathBuf::from("/usr/sbin/rap"),
            pam_service: "webdav".to_string(),
            access_log: PathBuf::from("/var/log/webdavd-access.log"),
            error_log: PathBuf::from("/var/log/webdavd-error.log"),
            ssl_certs: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<ServerConfig, ConfigError> {
        let root = Element::parse(text.as_bytes()).map_err(|e| ConfigError::Xml(e.to_string()))?;
        if root.name != "server-config" || root.namespace.as_deref() != Some(CONFIG_NAMESPACE) {
            return Err(ConfigError::Xml(
                "root node is not server-config in the webdavd namespace".into(),
            ));
        }

        // First <server> block wins; later ones are ignored with a warning,
        // matching `configure()`'s "break after first match" loop.
        let mut seen_server = false;
        let mut others = 0usize;
        let mut config = ServerConfig::default();
        for child in root.children.iter().filter_map(|n| n.as_element()) {
            if child.name == "server" {
                if seen_server {
                    others += 1;
                    continue;
                }
                seen_server = true;
                config = parse_server_block(child)?;
            }
        }
        if others > 0 {
            log::warn!("ignoring {others} extra <server> block(s) in config");
        }
        if !seen_server {
            return Err(ConfigError::NoServerBlock);
        }
        Ok(config)
    }
}

fn parse_server_block(server: &Element) -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    let mut restricted_seen = false;
    let mut mime_seen = false;
    let mut rap_binary_seen = false;
    let mut pam_seen = false;
    let mut access_log_seen = false;
    let mut error_log_seen = false;

    for el in server.children.iter().filter_map(|n| n.as_element()) {
        match el.name.as_str() {
            "listen" => config.listen.push(parse_listen_block(el)?),
            "session-timeout" => {
                if let Some(text) = el.get_text() {
                    config.session_timeout_secs = parse_session_timeout(text.trim())?;
                }
            }
            "max-user-sessions" => {
                if let Some(text) = el.get_text() {
                    config.max_user_sessions = text
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::Malformed(format!("max-user-sessions: {text}")))?;
                }
            }
            "restricted" => {
                reject_duplicate("restricted", restricted_seen)?;
                restricted_seen = true;
                config.restricted_user = el.get_text().map(|s| s.trim().to_string());
            }
            "mime-file" => {
                reject_duplicate("mime-file", mime_seen)?;
                mime_seen = true;
                if let Some(text) = el.get_text() {
                    config.mime_file = PathBuf::from(text.trim());
                }
            }
            "rap-binary" => {
                reject_duplicate("rap-binary", rap_binary_seen)?;
                rap_binary_seen = true;
                if let Some(text) = el.get_text() {
                    config.rap_binary = PathBuf::from(text.trim());
                }
            }
            "pam-service" => {
                reject_duplicate("pam-service", pam_seen)?;
                pam_seen = true;
                if let Some(text) = el.get_text() {
                    config.pam_service = text.trim().to_string();
                }
            }
            "access-log" => {
                reject_duplicate("access-log", access_log_seen)?;
                access_log_seen = true;
                if let Some(text) = el.get_text() {
                    config.access_log = PathBuf::from(text.trim());
                }
            }
            "error-log" => {
                reject_duplicate("error-log", error_log_seen)?;
                error_log_seen = true;
                if let Some(text) = el.get_text() {
                    config.error_log = PathBuf::from(text.trim());
                }
            }
            "ssl-cert" => config.ssl_certs.push(parse_ssl_cert_block(el)?),
            _ => {}
        }
    }

    Ok(config)
}

fn reject_duplicate(name: &str, seen: bool) -> Result<(), ConfigError> {
    if seen {
        Err(ConfigError::Malformed(format!("{name} specified more than once")))
    } else {
        Ok(())
    }
}

fn parse_listen_block(el: &Element) -> Result<ListenConfig, ConfigError> {
    let mut port = None;
    let mut host = None;
    let mut encryption = Encryption::None;

    for child in el.children.iter().filter_map(|n| n.as_element()) {
        match child.name.as_str() {
            "port" => {
                let text = child.get_text().unwrap_or_default();
                port = Some(
                    text.trim()
                        .parse::<u16>()
                        .map_err(|_| ConfigError::Malformed(format!("invalid port {text}")))?,
                );
            }
            "host" => host = child.get_text().map(|s| s.trim().to_string()),
            "encryption" => {
                let text = child.get_text().unwrap_or_default();
                encryption = match text.trim() {
                    "none" => Encryption::None,
                    "ssl" => Encryption::Ssl,
                    other => {
                        return Err(ConfigError::Malformed(format!("invalid encryption method {other}")))
                    }
                };
            }
            _ => {}
        }
    }

    let port = port.ok_or_else(|| ConfigError::Malformed("port not specified for listen".into()))?;
    Ok(ListenConfig { port, host, encryption })
}

fn parse_ssl_cert_block(el: &Element) -> Result<SslCertConfig, ConfigError> {
    let mut certificate = None;
    let mut key = None;
    let mut chain = Vec::new();

    for child in el.children.iter().filter_map(|n| n.as_element()) {
        match child.name.as_str() {
            "certificate" => certificate = child.get_text().map(|s| PathBuf::from(s.trim())),
            "key" => key = child.get_text().map(|s| PathBuf::from(s.trim())),
            "chain" => {
                if let Some(text) = child.get_text() {
                    chain.push(PathBuf::from(text.trim()));
                }
            }
            _ => {}
        }
    }

    let certificate = certificate
        .ok_or_else(|| ConfigError::Malformed("certificate not specified in ssl-cert".into()))?;
    let key = key.ok_or_else(|| ConfigError::Malformed("key not specified in ssl-cert".into()))?;
    Ok(SslCertConfig { certificate, key, chain })
}

/// Parses `SS`, `MM:SS` or `HH:MM:SS`, exactly as the source's hand-rolled
/// `strtol`-chain parser does -- deliberately not a duration-parsing crate,
/// since the grammar is loose (`"90"` means 90 seconds, not 90 minutes).
fn parse_session_timeout(s: &str) -> Result<u64, ConfigError> {
    let parts: Vec<&str> = s.split(':').collect();
    let nums: Result<Vec<u64>, _> = parts.iter().map(|p| p.parse::<u64>()).collect();
    let nums = nums.map_err(|_| ConfigError::Malformed(format!("invalid session timeout {s}")))?;
    let secs = match nums.as_slice() {
        [s] => *s,
        [m, s] => m * 60 + s,
        [h, m, s] => (h * 60 + m) * 60 + s,
        _ => return Err(ConfigError::Malformed(format!("invalid session timeout {s}"))),
    };
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
        <server-config xmlns="http://couling.me/webdavd">
          <server>
            <listen><port>80</port><encryption>none</encryption></listen>
            <listen><port>443</port><host>example.com</host><encryption>ssl</encryption></listen>
            <session-timeout>1:30:00</session-timeout>
            <max-user-sessions>20</max-user-sessions>
            <restricted>nobody</restricted>
            <ssl-cert>
              <certificate>/etc/cert.pem</certificate>
              <key>/etc/key.pem</key>
              <chain>/etc/chain.pem</chain>
            </ssl-cert>
          </server>
        </server-config>"#;

    #[test]
    fn parses_full_config() {
        let c = ServerConfig::parse(SAMPLE).unwrap();
        assert_eq!(c.listen.len(), 2);
        assert_eq!(c.listen[0].port, 80);
        assert_eq!(c.listen[0].encryption, Encryption::None);
        assert_eq!(c.listen[1].port, 443);
        assert_eq!(c.listen[1].encryption, Encryption::Ssl);
        assert_eq!(c.session_timeout_secs, 90 * 60);
        assert_eq!(c.max_user_sessions, 20);
        assert_eq!(c.restricted_user.as_deref(), Some("nobody"));
        assert_eq!(c.ssl_certs.len(), 1);
        assert_eq!(c.ssl_certs[0].chain.len(), 1);
    }

    #[test]
    fn defaults_apply_when_fields_omitted() {
        let xml = r#"<server-config xmlns="http://couling.me/webdavd">
            <server><listen><port>8080</port></listen></server>
        </server-config>"#;
        let c = ServerConfig::parse(xml).unwrap();
        assert_eq!(c.rap_binary, PathBuf::from("/usr/sbin/rap"));
        assert_eq!(c.mime_file, PathBuf::from("/etc/mime.types"));
        assert_eq!(c.pam_service, "webdav");
        assert_eq!(c.session_timeout_secs, 300);
        assert_eq!(c.max_user_sessions, 10);
    }

    #[test]
    fn session_timeout_grammar() {
        assert_eq!(parse_session_timeout("90").unwrap(), 90);
        assert_eq!(parse_session_timeout("5:00").unwrap(), 300);
        assert_eq!(parse_session_timeout("1:02:03").unwrap(), 3723);
        assert!(parse_session_timeout("abc").is_err());
    }

    #[test]
    fn missing_server_block_is_an_error() {
        let xml = r#"<server-config xmlns="http://couling.me/webdavd"></server-config>"#;
        assert!(matches!(ServerConfig::parse(xml), Err(ConfigError::NoServerBlock)));
    }
}
