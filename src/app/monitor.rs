//! Network Change Monitor：让虚拟网卡的出口跟随系统默认网络。

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::platform::{
    Connectivity, NetworkEvent, NetworkHandle, NetworkInfo, NetworkListener, NetworkType,
    TunInterface,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BindingSnapshot {
    /// `None` while no physical network is available.
    pub network: Option<u64>,
    pub network_type: Option<&'static str>,
    pub metered: bool,
    pub change_count: u64,
}

/// Listener registered with the OS for one interface.
///
/// Only holds a weak reference: a callback delivered after the interface was
/// released is dropped.
pub struct NetworkBinding {
    iface: Weak<dyn TunInterface>,
    state: Mutex<BindingSnapshot>,
}

impl NetworkBinding {
    pub fn new(iface: &Arc<dyn TunInterface>) -> Self {
        Self {
            iface: Arc::downgrade(iface),
            state: Mutex::new(BindingSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        self.lock().clone()
    }

    pub fn current_network(&self) -> Option<NetworkHandle> {
        self.lock().network.map(NetworkHandle)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    fn lock(&self) -> MutexGuard<'_, BindingSnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rebind(&self, iface: &dyn TunInterface, info: NetworkInfo) {
        iface.set_underlying_networks(Some(&[info.handle]));
        let mut state = self.lock();
        let changed = state.network != Some(info.handle.0);
        state.network = Some(info.handle.0);
        state.network_type = Some(info.network_type.as_str());
        state.metered = info.is_metered;
        state.change_count += 1;
        if changed {
            info!(
                network = info.handle.0,
                network_type = info.network_type.as_str(),
                metered = info.is_metered,
                "underlying network switched"
            );
        }
    }

    fn clear(&self, iface: &dyn TunInterface, lost: NetworkHandle) {
        iface.set_underlying_networks(None);
        let mut state = self.lock();
        state.network = None;
        state.network_type = Some(NetworkType::None.as_str());
        state.change_count += 1;
        info!(network = lost.0, "underlying network lost");
    }
}

impl NetworkListener for NetworkBinding {
    fn on_network_event(&self, event: NetworkEvent) {
        let Some(iface) = self.iface.upgrade() else {
            debug!(?event, "network event after interface release, ignored");
            return;
        };
        match event {
            NetworkEvent::Available(info) | NetworkEvent::CapabilitiesChanged(info) => {
                self.rebind(iface.as_ref(), info)
            }
            NetworkEvent::Lost(handle) => self.clear(iface.as_ref(), handle),
        }
    }
}

pub struct NetworkMonitor {
    connectivity: Arc<dyn Connectivity>,
    binding: Option<Arc<NetworkBinding>>,
}

impl NetworkMonitor {
    pub fn new(connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            connectivity,
            binding: None,
        }
    }

    pub fn attach(&mut self, iface: &Arc<dyn TunInterface>) -> anyhow::Result<()> {
        let binding = Arc::new(NetworkBinding::new(iface));
        self.connectivity
            .register_default_network(binding.clone())?;
        self.binding = Some(binding);
        debug!("default network callback registered");
        Ok(())
    }

    /// Always unregisters, attached or not.
    pub fn detach(&mut self) {
        self.connectivity.unregister_default_network();
        if self.binding.take().is_some() {
            debug!("default network callback unregistered");
        }
    }

    pub fn binding(&self) -> Option<Arc<NetworkBinding>> {
        self.binding.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.binding.is_some()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if self.binding.is_some() {
            warn!("network monitor dropped while attached");
            self.detach();
        }
    }
}
