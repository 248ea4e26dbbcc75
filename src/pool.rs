//! RAP session cache: `RapSession`/`RapGroup`/`RapPool` (spec §3, §4.3,
//! §5). One process-wide `RapPool` lives in the server's `ServerContext`;
//! all bookkeeping is guarded by a single `parking_lot::Mutex`, matching
//! the source's single counting semaphore (spec §5).

use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::errors::PoolError;
use crate::wire::{self, Channel};

/// The live state of one pooled RAP child. Shared via `Arc` so a leased
/// caller can hold and use the channel without keeping the pool lock held
/// (spec §5: "the pool lock must never be held across [control-socket
/// I/O]").
struct RapSlotData {
    pid: libc::pid_t,
    channel: Channel,
    created_at: Instant,
    /// The PAM-canonicalized username the RAP authenticated as (spec §3:
    /// "`user` (canonicalized by PAM)"), distinct from the raw Basic-auth
    /// credentials that key the enclosing `RapGroup`.
    user: String,
}

struct GroupSlot {
    data: Arc<RapSlotData>,
    in_use: bool,
}

struct RapGroup {
    user: String,
    password: String,
    slots: Vec<Option<GroupSlot>>,
}

struct PoolInner {
    groups: Vec<RapGroup>,
}

fn find_group(groups: &[RapGroup], user: &str, password: &str) -> Option<usize> {
    groups
        .binary_search_by(|g| (g.user.as_str(), g.password.as_str()).cmp(&(user, password)))
        .ok()
}

fn group_sort_key(g: &RapGroup) -> (&str, &str) {
    (g.user.as_str(), g.password.as_str())
}

/// The RAP pool manager. `acquire`/`release` realize spec §4.3;
/// `run_janitor`/`reap_children` realize the background tasks in §4.3/§5.
pub struct RapPool {
    inner: Mutex<PoolInner>,
    rap_binary: PathBuf,
    pam_service: String,
    mime_file: PathBuf,
    max_sessions_per_user: usize,
    max_session_life: Duration,
}

impl RapPool {
    pub fn new(
        rap_binary: PathBuf,
        pam_service: String,
        mime_file: PathBuf,
        max_sessions_per_user: u32,
        max_session_life: Duration,
    ) -> Arc<RapPool> {
        Arc::new(RapPool {
            inner: Mutex::new(PoolInner { groups: Vec::new() }),
            rap_binary,
            pam_service,
            mime_file,
            max_sessions_per_user: max_sessions_per_user as usize,
            max_session_life,
        })
    }

    /// Acquire a RAP for `(user, password)`, forking a new child if none is
    /// idle and the per-user cap allows it (spec §4.3). This does blocking
    /// I/O (fork/exec, a synchronous AUTHENTICATE round trip) and must be
    /// called from `tokio::task::spawn_blocking`.
    pub fn acquire(self: &Arc<Self>, user: &str, password: &str, rhost: &str) -> Result<RapLease, PoolError> {
        if user.is_empty() {
            return Err(PoolError::AuthFailed);
        }

        if let Some(outcome) = self.try_lease_existing(user, password) {
            return outcome;
        }

        let data = self.spawn_and_authenticate(user, password, rhost)?;
        self.insert_new_session(user, password, data)
    }

    /// Phase 1 (spec §4.3 steps 1-2, 4): look for a reusable slot, or
    /// short-circuit with `Backoff` if the group is already at capacity.
    /// Returns `None` when a new child should be spawned.
    fn try_lease_existing(&self, user: &str, password: &str) -> Option<Result<RapLease, PoolError>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let group_idx = find_group(&inner.groups, user, password)?;
        let group = &mut inner.groups[group_idx];

        let mut active = 0usize;
        let mut reuse_idx = None;
        for (i, slot) in group.slots.iter().enumerate() {
            if let Some(s) = slot {
                if s.in_use {
                    active += 1;
                } else if now.duration_since(s.data.created_at) < self.max_session_life && reuse_idx.is_none() {
                    reuse_idx = Some(i);
                }
            }
        }

        if let Some(i) = reuse_idx {
            let slot = group.slots[i].as_mut().unwrap();
            slot.in_use = true;
            let data = slot.data.clone();
            return Some(Ok(self.make_lease(user, password, data)));
        }
        if active >= self.max_sessions_per_user {
            return Some(Err(PoolError::Backoff));
        }
        None
    }

    /// Phase 2: fork+exec a RAP and drive the AUTHENTICATE handshake
    /// (spec §4.2 "AUTHENTICATE", §6 "RAP invocation").
    fn spawn_and_authenticate(&self, user: &str, password: &str, rhost: &str) -> Result<Arc<RapSlotData>, PoolError> {
        let (parent, child) = Channel::pair().map_err(|e| PoolError::AuthError(e.to_string()))?;
        let child_dup = child.try_clone().map_err(|e| PoolError::AuthError(e.to_string()))?;

        let mut cmd = Command::new(&self.rap_binary);
        cmd.arg(&self.pam_service).arg(&self.mime_file);
        // Safety: both fds are freshly duplicated, exclusively owned descriptors
        // of the same socketpair end; Stdio takes ownership of each.
        unsafe {
            cmd.stdin(Stdio::from_raw_fd(child.into_raw_fd()));
            cmd.stdout(Stdio::from_raw_fd(child_dup.into_raw_fd()));
        }

        let child_proc = cmd
            .spawn()
            .map_err(|e| PoolError::AuthError(format!("could not start rap: {e}")))?;
        let pid = child_proc.id() as libc::pid_t;
        // Reaped by the async SIGCHLD handler (`reap_children`), not by
        // `Child::wait` -- forgetting the handle avoids a double-waitpid race.
        std::mem::forget(child_proc);

        let msg = wire::Message::with_buffers(
            wire::Kind::Authenticate,
            vec![
                user.as_bytes().to_vec(),
                password.as_bytes().to_vec(),
                rhost.as_bytes().to_vec(),
            ],
        );
        parent.send(msg).map_err(|e| PoolError::AuthError(e.to_string()))?;

        let mut scratch = Vec::new();
        let reply = parent.recv(&mut scratch).map_err(|e| PoolError::AuthError(e.to_string()))?;
        match reply.kind {
            // Buffer 0 is the PAM-canonicalized username (see `rap::dispatch`);
            // fall back to the Basic-auth input if an older/odd RAP omits it.
            wire::Kind::Success => Ok(Arc::new(RapSlotData {
                pid,
                channel: parent,
                created_at: Instant::now(),
                user: reply.buf_str(0).unwrap_or(user).to_string(),
            })),
            wire::Kind::AuthFailed => Err(PoolError::AuthFailed),
            _ => Err(PoolError::AuthError("unexpected reply to AUTHENTICATE".into())),
        }
    }

    /// Phase 3 (spec §4.3 step 3): insert the newly-authenticated child
    /// into its group, allocating the group if absent, evicting an
    /// expired-idle slot if the group is full, or backing off (and
    /// destroying the new child) if every slot is live and in use.
    fn insert_new_session(
        self: &Arc<Self>,
        user: &str,
        password: &str,
        data: Arc<RapSlotData>,
    ) -> Result<RapLease, PoolError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let group_idx = find_group(&inner.groups, user, password).unwrap_or_else(|| {
            inner.groups.push(RapGroup {
                user: user.to_string(),
                password: password.to_string(),
                slots: (0..self.max_sessions_per_user).map(|_| None).collect(),
            });
            inner.groups.sort_by(|a, b| group_sort_key(a).cmp(&group_sort_key(b)));
            find_group(&inner.groups, user, password).expect("just inserted")
        });

        let group = &mut inner.groups[group_idx];
        let mut target = group.slots.iter().position(|s| s.is_none());
        if target.is_none() {
            target = group.slots.iter().position(|s| {
                let s = s.as_ref().unwrap();
                !s.in_use && now.duration_since(s.data.created_at) >= self.max_session_life
            });
        }

        match target {
            Some(i) => {
                group.slots[i] = Some(GroupSlot { data: data.clone(), in_use: true });
                Ok(self.make_lease(user, password, data))
            }
            // Group is full of live, in-use sessions: drop `data`, closing its
            // channel, which is enough to make the freshly-spawned child see
            // EOF on its next recv and exit; the janitor's reaper collects it.
            None => Err(PoolError::Backoff),
        }
    }

    fn make_lease(self: &Arc<Self>, user: &str, password: &str, data: Arc<RapSlotData>) -> RapLease {
        RapLease {
            pool: self.clone(),
            user: user.to_string(),
            password: password.to_string(),
            data,
            destroyed: false,
        }
    }

    fn release_slot(&self, user: &str, password: &str, data: &Arc<RapSlotData>) {
        let mut inner = self.inner.lock();
        if let Some(gi) = find_group(&inner.groups, user, password) {
            for slot in inner.groups[gi].slots.iter_mut().flatten() {
                if Arc::ptr_eq(&slot.data, data) {
                    slot.in_use = false;
                    return;
                }
            }
        }
    }

    fn destroy_slot(&self, user: &str, password: &str, data: &Arc<RapSlotData>) {
        let mut inner = self.inner.lock();
        if let Some(gi) = find_group(&inner.groups, user, password) {
            for slot_opt in inner.groups[gi].slots.iter_mut() {
                let matches = matches!(slot_opt, Some(s) if Arc::ptr_eq(&s.data, data));
                if matches {
                    *slot_opt = None;
                    return;
                }
            }
        }
    }

    /// `(active, total)` slots for one group; used by tests and by the
    /// `Backoff` decision path's counterparts in other methods.
    pub fn counts_for(&self, user: &str, password: &str) -> (usize, usize) {
        let inner = self.inner.lock();
        match find_group(&inner.groups, user, password) {
            Some(gi) => {
                let group = &inner.groups[gi];
                let active = group.slots.iter().flatten().filter(|s| s.in_use).count();
                let total = group.slots.iter().flatten().count();
                (active, total)
            }
            None => (0, 0),
        }
    }

    /// Background janitor: wakes every `max_session_life / 2` and destroys
    /// any slot that is idle and past its expiry (spec §4.3 "Janitor").
    pub async fn run_janitor(self: Arc<Self>) {
        let period = (self.max_session_life / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let mut inner = self.inner.lock();
            for group in inner.groups.iter_mut() {
                for slot in group.slots.iter_mut() {
                    let expired = matches!(slot, Some(s) if !s.in_use && now.duration_since(s.data.created_at) >= self.max_session_life);
                    if expired {
                        *slot = None;
                    }
                }
            }
        }
    }

    /// Non-blocking SIGCHLD reaper (spec §4.3 "SIGCHLD handler"): drains
    /// exited children and logs abnormal exits. Slot bookkeeping is a
    /// separate concern (handled by `release`/`destroy`/the janitor); this
    /// task exists purely to prevent zombies.
    pub async fn reap_children() -> std::io::Result<()> {
        let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child())?;
        loop {
            stream.recv().await;
            loop {
                let mut status: libc::c_int = 0;
                let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                if pid <= 0 {
                    break;
                }
                if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0 {
                    log::warn!("rap pid {pid} exited with status {}", libc::WEXITSTATUS(status));
                } else if libc::WIFSIGNALED(status) {
                    log::warn!("rap pid {pid} killed by signal {}", libc::WTERMSIG(status));
                }
            }
        }
    }
}

/// An exclusive lease on one `RapSession`'s control channel (spec §3
/// "Lease"). Dropping a lease releases the slot back to the pool; call
/// [`RapLease::destroy`] instead when the session must not be reused
/// (spec §4.4: "any control-channel I/O failure after a session is
/// committed => 500 and the session is destroyed, not released").
pub struct RapLease {
    pool: Arc<RapPool>,
    user: String,
    password: String,
    data: Arc<RapSlotData>,
    destroyed: bool,
}

impl RapLease {
    pub fn channel(&self) -> &Channel {
        &self.data.channel
    }

    pub fn pid(&self) -> libc::pid_t {
        self.data.pid
    }

    /// The PAM-canonicalized identity this session authenticated as; used
    /// for the access log instead of the raw Basic-auth username (spec §3).
    pub fn user(&self) -> &str {
        &self.data.user
    }

    /// Mark this session for destruction instead of release; takes effect
    /// when the lease is dropped.
    pub fn destroy(mut self) {
        self.destroyed = true;
    }
}

impl Drop for RapLease {
    fn drop(&mut self) {
        if self.destroyed {
            self.pool.destroy_slot(&self.user, &self.password, &self.data);
        } else {
            self.pool.release_slot(&self.user, &self.password, &self.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inserts a slot directly, bypassing fork/exec, so pool bookkeeping can
    /// be tested without a real PAM stack or rap binary.
    fn fake_pool(max_sessions_per_user: u32, max_session_life: Duration) -> Arc<RapPool> {
        RapPool::new(
            PathBuf::from("/bin/true"),
            "webdav".to_string(),
            PathBuf::from("/etc/mime.types"),
            max_sessions_per_user,
            max_session_life,
        )
    }

    fn fake_data() -> Arc<RapSlotData> {
        fake_data_for("alice")
    }

    fn fake_data_for(user: &str) -> Arc<RapSlotData> {
        let (a, _b) = Channel::pair().unwrap();
        Arc::new(RapSlotData { pid: 1, channel: a, created_at: Instant::now(), user: user.to_string() })
    }

    #[test]
    fn exclusive_leasing() {
        let pool = fake_pool(10, Duration::from_secs(300));
        let data = fake_data();
        let lease1 = pool.insert_new_session("alice", "pw", data).unwrap();
        assert_eq!(pool.counts_for("alice", "pw"), (1, 1));
        drop(lease1);
        assert_eq!(pool.counts_for("alice", "pw"), (0, 1));
    }

    #[test]
    fn per_user_cap_triggers_backoff() {
        let pool = fake_pool(2, Duration::from_secs(300));
        let l1 = pool.insert_new_session("alice", "pw", fake_data()).unwrap();
        let l2 = pool.insert_new_session("alice", "pw", fake_data()).unwrap();
        assert_eq!(pool.counts_for("alice", "pw"), (2, 2));
        let err = pool.try_lease_existing("alice", "pw").unwrap().unwrap_err();
        assert!(matches!(err, PoolError::Backoff));
        drop(l1);
        drop(l2);
    }

    #[test]
    fn released_session_is_reused() {
        let pool = fake_pool(1, Duration::from_secs(300));
        let data = fake_data();
        let pid = data.pid;
        let lease = pool.insert_new_session("alice", "pw", data).unwrap();
        drop(lease);
        let reused = pool.try_lease_existing("alice", "pw").unwrap().unwrap();
        assert_eq!(reused.pid(), pid);
    }

    #[test]
    fn destroyed_session_is_not_reused() {
        let pool = fake_pool(1, Duration::from_secs(300));
        let lease = pool.insert_new_session("alice", "pw", fake_data()).unwrap();
        lease.destroy();
        assert_eq!(pool.counts_for("alice", "pw"), (0, 0));
    }

    /// The group table is still keyed by the raw Basic-auth (user, password)
    /// pair, but the lease reports the PAM-canonicalized identity (spec §3).
    #[test]
    fn lease_reports_canonical_user_not_lookup_key() {
        let pool = fake_pool(10, Duration::from_secs(300));
        let data = fake_data_for("alice.canonical");
        let lease = pool.insert_new_session("alice", "pw", data).unwrap();
        assert_eq!(lease.user(), "alice.canonical");
        assert_eq!(pool.counts_for("alice", "pw"), (1, 1));
    }

    #[test]
    fn empty_user_is_auth_failed() {
        let pool = fake_pool(10, Duration::from_secs(300));
        let err = pool.acquire("", "pw", "host").unwrap_err();
        assert!(matches!(err, PoolError::AuthFailed));
    }
}
