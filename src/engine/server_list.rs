use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::models::ServerEntry;
use crate::storage::SystemInfo;

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Named server addresses plus the selected one, persisted in the settings.
pub struct ServerList {
    system_info: Arc<SystemInfo>,
    listeners: Mutex<Vec<Listener>>,
}

impl ServerList {
    pub fn new(system_info: Arc<SystemInfo>) -> Self {
        // Drop a selection that points at a missing entry.
        let dangling = system_info.read(|s| {
            s.selected_server
                .as_deref()
                .is_some_and(|name| s.server_entry(name).is_none())
        });
        if dangling {
            system_info.update(|s| s.selected_server = None);
        }
        Self {
            system_info,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<ServerEntry> {
        self.system_info.read(|s| s.servers.clone())
    }

    pub fn selected_entry(&self) -> Option<ServerEntry> {
        self.system_info.read(|s| {
            s.selected_server
                .as_deref()
                .and_then(|name| s.server_entry(name))
                .cloned()
        })
    }

    /// Run `listener` after every change.
    pub fn on_changed(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Receive a message after every change.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_changed(move || {
            let _ = tx.send(());
        });
        rx
    }

    /// Add an entry, or update the address of the entry with the same name.
    ///
    /// The entry becomes selected when nothing is selected yet.
    pub fn add_entry(&self, entry: ServerEntry) -> Result<(), String> {
        info!(
            "servers: adding {} ({})",
            entry.server_name, entry.server_address
        );
        self.system_info.update(|s| {
            match s
                .servers
                .iter_mut()
                .find(|existing| existing.server_name == entry.server_name)
            {
                Some(existing) => existing.server_address = entry.server_address.clone(),
                None => s.servers.push(entry.clone()),
            }
            if s.selected_server.is_none() {
                s.selected_server = Some(entry.server_name.clone());
            }
        });
        self.save_and_notify()
    }

    /// Remove an entry. A removed selection falls back to the first remaining entry.
    pub fn remove_entry(&self, server_name: &str) -> Result<(), String> {
        let removed = self.system_info.update(|s| {
            let Some(index) = s.servers.iter().position(|e| e.server_name == server_name) else {
                return false;
            };
            s.servers.remove(index);
            if s.selected_server.as_deref() == Some(server_name) {
                s.selected_server = s.servers.first().map(|e| e.server_name.clone());
            }
            true
        });
        if !removed {
            return Ok(());
        }
        info!("servers: removed {server_name}");
        self.save_and_notify()
    }

    pub fn set_server_active(&self, server_name: &str) -> Result<(), String> {
        let found = self.system_info.update(|s| {
            if s.server_entry(server_name).is_none() {
                return false;
            }
            s.selected_server = Some(server_name.to_owned());
            true
        });
        if !found {
            return Ok(());
        }
        info!("servers: selected {server_name}");
        self.save_and_notify()
    }

    fn save_and_notify(&self) -> Result<(), String> {
        let saved = self.system_info.save();
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener();
        }
        saved
    }
}
