use serde::{Deserialize, Serialize};

/// Named server address stored in the launcher settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerEntry {
    pub server_name: String,
    pub server_address: String,
}

impl ServerEntry {
    pub fn new(server_name: impl Into<String>, server_address: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            server_address: server_address.into(),
        }
    }
}

/// Split `host:port`. The port is `None` when the address has none.
///
/// IPv6 hosts need brackets to carry a port (`[::1]:2001`); a bare IPv6
/// literal is returned whole.
pub fn split_port(address: &str) -> (&str, Option<&str>) {
    if let Some(rest) = address.strip_prefix('[')
        && let Some((host, tail)) = rest.split_once(']')
    {
        return (host, tail.strip_prefix(':'));
    }
    if address.matches(':').count() > 1 {
        return (address, None);
    }
    match address.split_once(':') {
        Some((host, port)) if !host.is_empty() => (host, Some(port)),
        _ => (address, None),
    }
}
