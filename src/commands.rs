//! Command surface exposed to the surrounding application.
//!
//! [`BlockerCommands`] wires the persisted state, the lock and the tunnel
//! together. Whatever needs the host OS (tunnel consent, accessibility
//! settings, installed app enumeration) goes through [`Platform`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::blocklist::BlocklistStore;
use crate::error::{Error, Result};
use crate::lock::{LockGate, LockState};
use crate::tunnel::{TunnelController, TunnelStatus};

/// An installed application, as listed for the picker UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub package_name: String,
    pub app_name: String,
    pub icon_base64: String,
}

/// Interactive permission to create the tunnel.
pub trait VpnConsent: Send + Sync {
    /// Fails when the platform cannot host the tunnel at all.
    fn ensure_vpn_available(&self) -> Result<()> {
        Ok(())
    }

    /// Ask for consent if not already granted. `Ok(false)` means the user
    /// declined.
    fn request(&self) -> Result<bool>;
}

/// Accessibility service hosting the foreground monitor.
pub trait AccessibilityHost: Send + Sync {
    /// Fails when the platform has no accessibility service at all.
    fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> Result<bool>;

    fn open_settings(&self) -> Result<()>;
}

/// OS package manager enumeration.
pub trait AppCatalog: Send + Sync {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>>;
}

/// Everything the commands need from the host OS.
pub trait Platform: VpnConsent + AccessibilityHost + AppCatalog {}

impl<T: VpnConsent + AccessibilityHost + AppCatalog> Platform for T {}

/// Platform without tunnel or accessibility support.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedPlatform;

impl VpnConsent for UnsupportedPlatform {
    fn ensure_vpn_available(&self) -> Result<()> {
        Err(Error::Unsupported("VPN blocker"))
    }

    fn request(&self) -> Result<bool> {
        Err(Error::Unsupported("VPN blocker"))
    }
}

impl AccessibilityHost for UnsupportedPlatform {
    fn ensure_available(&self) -> Result<()> {
        Err(Error::Unsupported("app blocker"))
    }

    fn is_enabled(&self) -> Result<bool> {
        Err(Error::Unsupported("accessibility permission"))
    }

    fn open_settings(&self) -> Result<()> {
        Err(Error::Unsupported("accessibility settings"))
    }
}

impl AppCatalog for UnsupportedPlatform {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        Err(Error::Unsupported("installed app listing"))
    }
}

/// Headless daemon: the process already holds the privileges to create the
/// tunnel, and focus events are fed in by the operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessPlatform;

impl VpnConsent for HeadlessPlatform {
    fn request(&self) -> Result<bool> {
        Ok(true)
    }
}

impl AccessibilityHost for HeadlessPlatform {
    fn is_enabled(&self) -> Result<bool> {
        Ok(true)
    }

    fn open_settings(&self) -> Result<()> {
        Err(Error::Unsupported("accessibility settings"))
    }
}

impl AppCatalog for HeadlessPlatform {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        Err(Error::Unsupported("installed app listing"))
    }
}

pub struct BlockerCommands {
    store: BlocklistStore,
    gate: LockGate,
    tunnel: Arc<TunnelController>,
    platform: Arc<dyn Platform>,
}

impl BlockerCommands {
    pub fn new(
        store: BlocklistStore,
        gate: LockGate,
        tunnel: Arc<TunnelController>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            store,
            gate,
            tunnel,
            platform,
        }
    }

    pub fn tunnel(&self) -> &Arc<TunnelController> {
        &self.tunnel
    }

    /// Persist `domains`, obtain consent, then start the tunnel.
    pub fn start_vpn_blocker<S: AsRef<str>>(&self, domains: &[S]) -> Result<()> {
        self.platform.ensure_vpn_available()?;
        self.store.save_domains(domains)?;
        if !self.platform.request()? {
            return Err(Error::PermissionDenied);
        }
        self.tunnel.start()
    }

    pub fn stop_vpn_blocker(&self) -> Result<()> {
        self.platform.ensure_vpn_available()?;
        self.tunnel.stop();
        Ok(())
    }

    pub fn vpn_status(&self) -> Result<TunnelStatus> {
        self.platform.ensure_vpn_available()?;
        Ok(self.tunnel.status())
    }

    pub fn start_app_blocker<S: AsRef<str>>(&self, packages: &[S]) -> Result<()> {
        self.platform.ensure_available()?;
        self.store.save_blocked_apps(packages)?;
        info!(count = packages.len(), "app blocker started");
        Ok(())
    }

    pub fn update_blocked_apps<S: AsRef<str>>(&self, packages: &[S]) -> Result<()> {
        self.platform.ensure_available()?;
        self.store.save_blocked_apps(packages)
    }

    pub fn stop_app_blocker(&self) -> Result<()> {
        self.platform.ensure_available()?;
        self.store.clear_blocked_apps()?;
        info!("app blocker stopped");
        Ok(())
    }

    pub fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        self.platform.installed_apps()
    }

    pub fn check_accessibility_permission(&self) -> Result<bool> {
        self.platform.is_enabled()
    }

    pub fn open_accessibility_settings(&self) -> Result<()> {
        self.platform.open_settings()
    }

    pub fn save_lock_expiry(&self, expiry: &str) -> Result<()> {
        self.gate.set_expiry(expiry)
    }

    /// Extend the lock and return the new expiry as RFC 3339.
    pub fn extend_lock(&self, hours: u32) -> Result<String> {
        self.gate.extend(hours).map(|expiry| expiry.to_rfc3339())
    }

    pub fn lock_state(&self) -> LockState {
        self.gate.state()
    }

    /// Device restart: bring the tunnel back only while locked with a
    /// non-empty domain list. Returns whether the tunnel was started.
    pub fn on_boot(&self) -> Result<bool> {
        self.platform.ensure_vpn_available()?;
        if !self.gate.is_locked() {
            info!("lock expired, not restarting tunnel");
            return Ok(false);
        }

        let domains = self.store.domains()?;
        if domains.is_empty() {
            info!("no domains to block, not restarting tunnel");
            return Ok(false);
        }

        info!(domains = domains.len(), "restarting tunnel after boot");
        self.tunnel.start()?;
        Ok(true)
    }
}
