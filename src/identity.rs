//! Machine identity.
//!
//! The machine id is the agent's stable identifier across reconnects. It is
//! recomputed at the start of every connect attempt so a NIC hot-plug is
//! picked up, but on a given machine the stable sources make it
//! deterministic for the lifetime of the process. It is never empty.
//!
//! Resolution order (first non-empty wins):
//! 1. A caller-supplied fixed id (this also covers "random": the caller
//!    resolves a random id once and passes it as fixed).
//! 2. A platform serial (Darwin) or the DMI product UUID (Linux).
//! 3. Sorted non-loopback MAC addresses joined by `;`.
//! 4. A random UUID as the last resort.

use uuid::Uuid;

/// How the machine id is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidPolicy {
    /// Use this exact id.
    Fixed(String),
    /// Derive a stable id from the platform.
    Stable,
}

impl MidPolicy {
    /// Resolve a "random id" request into a fixed policy so every connect
    /// attempt registers the same id for this process.
    pub fn random() -> Self {
        MidPolicy::Fixed(Uuid::new_v4().to_string())
    }
}

/// Compute the machine id under `policy`.
pub fn machine_id(policy: &MidPolicy) -> String {
    match policy {
        MidPolicy::Fixed(mid) => mid.clone(),
        MidPolicy::Stable => stable_machine_id(),
    }
}

fn stable_machine_id() -> String {
    if let Some(id) = platform_serial() {
        return id;
    }
    if let Some(id) = mac_addresses() {
        return id;
    }
    Uuid::new_v4().to_string()
}

#[cfg(target_os = "linux")]
fn platform_serial() -> Option<String> {
    let uuid = std::fs::read_to_string("/sys/class/dmi/id/product_uuid").ok()?;
    let uuid = uuid.trim();
    if uuid.is_empty() {
        None
    } else {
        Some(uuid.to_string())
    }
}

#[cfg(target_os = "macos")]
fn platform_serial() -> Option<String> {
    let output = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if let Some(rest) = line.split("\"IOPlatformSerialNumber\" = \"").nth(1) {
            if let Some(serial) = rest.split('"').next() {
                if !serial.is_empty() {
                    return Some(serial.to_string());
                }
            }
        }
    }
    None
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_serial() -> Option<String> {
    None
}

/// Non-loopback interface MACs, sorted by interface name, joined by `;`.
#[cfg(target_os = "linux")]
fn mac_addresses() -> Option<String> {
    let mut ifaces: Vec<String> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    ifaces.sort();

    let mut macs = Vec::new();
    for iface in ifaces {
        if let Ok(mac) = std::fs::read_to_string(format!("/sys/class/net/{iface}/address")) {
            let mac = mac.trim();
            if !mac.is_empty() {
                macs.push(mac.to_string());
            }
        }
    }
    if macs.is_empty() {
        None
    } else {
        Some(macs.join(";"))
    }
}

#[cfg(not(target_os = "linux"))]
fn mac_addresses() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_is_verbatim() {
        assert_eq!(machine_id(&MidPolicy::Fixed("alpha".into())), "alpha");
    }

    #[test]
    fn random_policy_is_stable_for_process() {
        let policy = MidPolicy::random();
        let a = machine_id(&policy);
        let b = machine_id(&policy);
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn random_policies_differ() {
        assert_ne!(
            machine_id(&MidPolicy::random()),
            machine_id(&MidPolicy::random())
        );
    }

    #[test]
    fn stable_id_is_never_empty() {
        let id = machine_id(&MidPolicy::Stable);
        assert!(!id.is_empty());
    }
}
