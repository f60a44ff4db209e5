//! Foreground application interception.
//!
//! The OS glue forwards window focus notifications to
//! [`ForegroundMonitor::handle_event`]; the monitor decides whether the app
//! that came to the foreground must be covered by the blocking screen.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::blocklist::BlocklistStore;
use crate::config::AppBlockerSettings;
use crate::lock::LockGate;

/// Packages that are never blocked, whatever the user list says.
pub const SYSTEM_PACKAGES: [&str; 6] = [
    "com.android.systemui",
    "com.android.launcher",
    "com.android.launcher3",
    "com.google.android.apps.nexuslauncher",
    "com.android.settings",
    "com.android.packageinstaller",
];

/// Brings the blocking screen to the foreground.
///
/// Called from the notification handler: implementations must hand the work
/// off and return immediately.
pub trait Redirector: Send + Sync {
    fn redirect(&self, package: &str);
}

impl<F> Redirector for F
where
    F: Fn(&str) + Send + Sync,
{
    fn redirect(&self, package: &str) {
        self(package);
    }
}

impl Redirector for mpsc::UnboundedSender<String> {
    fn redirect(&self, package: &str) {
        if self.send(package.to_string()).is_err() {
            warn!(package, "redirect receiver is gone");
        }
    }
}

/// Kind of accessibility notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEventKind {
    /// A window came to the foreground.
    StateChanged,
    ContentChanged,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEvent {
    pub kind: WindowEventKind,
    pub package: Option<String>,
}

impl WindowEvent {
    pub fn foreground(package: impl Into<String>) -> Self {
        Self {
            kind: WindowEventKind::StateChanged,
            package: Some(package.into()),
        }
    }
}

/// Outcome of one foreground change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not a foreground change, or no package attached.
    Irrelevant,
    /// System or own package.
    Exempt,
    Unlocked,
    NotBlocked,
    /// Same package was redirected less than the debounce window ago.
    Debounced,
    Redirected,
}

pub struct ForegroundMonitor {
    store: BlocklistStore,
    gate: LockGate,
    redirector: Arc<dyn Redirector>,
    exempt: HashSet<String>,
    debounce: Duration,
    last_redirect: Mutex<Option<(String, Instant)>>,
}

impl ForegroundMonitor {
    pub fn new(
        store: BlocklistStore,
        gate: LockGate,
        redirector: Arc<dyn Redirector>,
        settings: &AppBlockerSettings,
    ) -> Self {
        let exempt = SYSTEM_PACKAGES
            .iter()
            .map(|p| (*p).to_string())
            .chain(std::iter::once(settings.own_package.clone()))
            .collect();

        Self {
            store,
            gate,
            redirector,
            exempt,
            debounce: Duration::from_millis(settings.redirect_debounce_ms),
            last_redirect: Mutex::new(None),
        }
    }

    pub fn is_exempt(&self, package: &str) -> bool {
        self.exempt.contains(package)
    }

    /// Entry point for raw accessibility notifications.
    pub fn handle_event(&self, event: &WindowEvent) -> Decision {
        if event.kind != WindowEventKind::StateChanged {
            return Decision::Irrelevant;
        }
        match event.package.as_deref() {
            Some(package) if !package.is_empty() => self.on_foreground_changed(package),
            _ => Decision::Irrelevant,
        }
    }

    pub fn on_foreground_changed(&self, package: &str) -> Decision {
        self.on_foreground_changed_at(package, Instant::now())
    }

    /// Same as [`Self::on_foreground_changed`] with an explicit event time.
    pub fn on_foreground_changed_at(&self, package: &str, now: Instant) -> Decision {
        if self.is_exempt(package) {
            return Decision::Exempt;
        }

        // Read on every event so list edits apply without a restart.
        let blocked = match self.store.blocked_apps() {
            Ok(blocked) => blocked,
            Err(err) => {
                warn!(error = %err, "failed to read blocked apps");
                HashSet::new()
            }
        };

        if !self.gate.is_locked() {
            return Decision::Unlocked;
        }
        if !blocked.contains(package) {
            return Decision::NotBlocked;
        }

        {
            let mut last = self.last_redirect.lock();
            if let Some((previous, at)) = last.as_ref()
                && previous == package
                && now.saturating_duration_since(*at) < self.debounce
            {
                debug!(package, "redirect debounced");
                return Decision::Debounced;
            }
            *last = Some((package.to_string(), now));
        }

        self.redirector.redirect(package);
        info!(package, "blocked foreground app");
        Decision::Redirected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::tests::ManualClock;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        monitor: ForegroundMonitor,
        gate: LockGate,
        store: BlocklistStore,
        redirects: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let store = BlocklistStore::in_memory();
        store.save_blocked_apps(&["com.example.game"]).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        ));
        let gate = LockGate::with_clock(store.clone(), clock);

        let redirects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&redirects);
        let redirector = move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        let monitor = ForegroundMonitor::new(
            store.clone(),
            gate.clone(),
            Arc::new(redirector),
            &AppBlockerSettings::default(),
        );
        Fixture {
            monitor,
            gate,
            store,
            redirects,
        }
    }

    #[test]
    fn should_follow_lock_and_debounce() {
        let f = fixture();
        let t0 = Instant::now();

        assert_eq!(
            f.monitor.on_foreground_changed_at("com.example.game", t0),
            Decision::Unlocked
        );
        assert_eq!(f.redirects.load(Ordering::SeqCst), 0);

        f.gate.extend(1).unwrap();
        assert_eq!(
            f.monitor.on_foreground_changed_at("com.example.game", t0),
            Decision::Redirected
        );
        assert_eq!(
            f.monitor
                .on_foreground_changed_at("com.example.game", t0 + Duration::from_millis(500)),
            Decision::Debounced
        );
        assert_eq!(f.redirects.load(Ordering::SeqCst), 1);

        assert_eq!(
            f.monitor
                .on_foreground_changed_at("com.example.game", t0 + Duration::from_millis(1100)),
            Decision::Redirected
        );
        assert_eq!(f.redirects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn should_not_debounce_a_different_package() {
        let f = fixture();
        f.store
            .save_blocked_apps(&["com.example.game", "com.example.feed"])
            .unwrap();
        f.gate.extend(1).unwrap();
        let t0 = Instant::now();

        f.monitor.on_foreground_changed_at("com.example.game", t0);
        assert_eq!(
            f.monitor
                .on_foreground_changed_at("com.example.feed", t0 + Duration::from_millis(10)),
            Decision::Redirected
        );
        assert_eq!(
            f.monitor
                .on_foreground_changed_at("com.example.game", t0 + Duration::from_millis(20)),
            Decision::Redirected
        );
        assert_eq!(f.redirects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn should_exempt_system_and_own_packages() {
        let f = fixture();
        f.store
            .save_blocked_apps(&["com.android.settings", "com.tamashii.app"])
            .unwrap();
        f.gate.extend(1).unwrap();

        assert_eq!(
            f.monitor.on_foreground_changed("com.android.settings"),
            Decision::Exempt
        );
        assert_eq!(
            f.monitor.on_foreground_changed("com.tamashii.app"),
            Decision::Exempt
        );
        assert_eq!(f.redirects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn should_pick_up_list_changes_immediately() {
        let f = fixture();
        f.gate.extend(1).unwrap();

        assert_eq!(
            f.monitor.on_foreground_changed("com.example.video"),
            Decision::NotBlocked
        );
        f.store.save_blocked_apps(&["com.example.video"]).unwrap();
        assert_eq!(
            f.monitor.on_foreground_changed("com.example.video"),
            Decision::Redirected
        );

        f.store.clear_blocked_apps().unwrap();
        assert_eq!(
            f.monitor.on_foreground_changed("com.example.game"),
            Decision::NotBlocked
        );
    }

    #[test]
    fn should_only_react_to_foreground_changes() {
        let f = fixture();
        f.gate.extend(1).unwrap();

        let content = WindowEvent {
            kind: WindowEventKind::ContentChanged,
            package: Some("com.example.game".into()),
        };
        let anonymous = WindowEvent {
            kind: WindowEventKind::StateChanged,
            package: None,
        };
        assert_eq!(f.monitor.handle_event(&content), Decision::Irrelevant);
        assert_eq!(f.monitor.handle_event(&anonymous), Decision::Irrelevant);
        assert_eq!(
            f.monitor
                .handle_event(&WindowEvent::foreground("com.example.game")),
            Decision::Redirected
        );
    }

    #[test]
    fn should_stop_redirecting_once_lock_expires() {
        let store = BlocklistStore::in_memory();
        store.save_blocked_apps(&["com.example.game"]).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        ));
        let gate = LockGate::with_clock(store.clone(), clock.clone());
        gate.extend(1).unwrap();
        let monitor = ForegroundMonitor::new(
            store,
            gate,
            Arc::new(|_: &str| {}),
            &AppBlockerSettings::default(),
        );

        assert_eq!(
            monitor.on_foreground_changed("com.example.game"),
            Decision::Redirected
        );
        clock.advance(TimeDelta::hours(2));
        assert_eq!(
            monitor.on_foreground_changed("com.example.game"),
            Decision::Unlocked
        );
    }

    #[test]
    fn test_channel_redirector_is_non_blocking() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.redirect("com.example.game");
        assert_eq!(rx.try_recv().unwrap(), "com.example.game");

        drop(rx);
        tx.redirect("com.example.game");
    }
}
