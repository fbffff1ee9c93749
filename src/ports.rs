use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Ports whose exposure alone warrants attention beyond their static risk tier:
/// cleartext mail and resolver services often abused as relays, plus ports
/// commonly used by backdoors and botnet control channels.
pub const SUSPICIOUS_PORTS: &[u16] = &[
    25, 53, 110, 143, 1080, 2323, 4444, 5554, 6666, 6667, 12345, 27374, 31337,
];

/// Parse a ports file content into a deduplicated list of TCP ports (1..=65535).
///
/// Supported formats per line:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut set = PortSet::default();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        set.push_item(line)
            .with_context(|| format!("line {line_no}: invalid entry: {line}"))?;
    }
    Ok(set.ports)
}

/// Parse a command-line port spec such as `22,80,8000-8010`.
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>> {
    let mut set = PortSet::default();
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        set.push_item(item)
            .with_context(|| format!("invalid port spec entry: {item}"))?;
    }
    if set.ports.is_empty() {
        bail!("port spec is empty: {spec:?}");
    }
    Ok(set.ports)
}

/// Load a ports list from a file path. Errors if the file cannot be read or parsed.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

/// The privileged range, 1 through 1024.
pub fn default_ports() -> Vec<u16> {
    (1..=1024).collect()
}

/// Best-effort service name for a port, `Unknown-<port>` when not well known.
pub fn service_name(port: u16) -> String {
    well_known_service(port)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown-{port}"))
}

pub fn is_suspicious(port: u16) -> bool {
    SUSPICIOUS_PORTS.contains(&port)
}

fn well_known_service(port: u16) -> Option<&'static str> {
    let name = match port {
        20 => "FTP-Data",
        21 => "FTP",
        22 => "SSH",
        23 => "Telnet",
        25 => "SMTP",
        53 => "DNS",
        67 => "DHCP",
        69 => "TFTP",
        80 => "HTTP",
        110 => "POP3",
        111 => "RPCbind",
        123 => "NTP",
        135 => "MS-RPC",
        137 => "NetBIOS-NS",
        139 => "NetBIOS-SSN",
        143 => "IMAP",
        161 => "SNMP",
        389 => "LDAP",
        443 => "HTTPS",
        445 => "SMB",
        465 => "SMTPS",
        514 => "Syslog",
        587 => "SMTP-Submission",
        631 => "IPP",
        993 => "IMAPS",
        995 => "POP3S",
        1080 => "SOCKS",
        1433 => "MSSQL",
        1521 => "Oracle",
        1723 => "PPTP",
        1883 => "MQTT",
        2049 => "NFS",
        2375 => "Docker",
        3306 => "MySQL",
        3389 => "RDP",
        5432 => "PostgreSQL",
        5672 => "AMQP",
        5900 => "VNC",
        5985 => "WinRM",
        6379 => "Redis",
        6667 => "IRC",
        8080 => "HTTP-Proxy",
        8443 => "HTTPS-Alt",
        9200 => "Elasticsearch",
        11211 => "Memcached",
        27017 => "MongoDB",
        _ => return None,
    };
    Some(name)
}

#[derive(Default)]
struct PortSet {
    ports: Vec<u16>,
    seen: HashSet<u16>,
}

impl PortSet {
    fn push_item(&mut self, item: &str) -> Result<()> {
        if let Some((a, b)) = item.split_once('-') {
            let start = parse_port_str(a.trim())
                .with_context(|| format!("invalid start in range: {a}"))?;
            let end = parse_port_str(b.trim())
                .with_context(|| format!("invalid end in range: {b}"))?;
            if start > end {
                bail!("invalid range {start}-{end} (start > end)");
            }
            for p in start..=end {
                self.push(p);
            }
            return Ok(());
        }
        let p = parse_port_str(item)?;
        self.push(p);
        Ok(())
    }

    fn push(&mut self, port: u16) {
        if self.seen.insert(port) {
            self.ports.push(port);
        }
    }
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ranges_and_dedup() {
        let input = "8000-8002\n80\n8001\n";
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000\n").is_err());
        assert!(parse_ports_str("90-80\n").is_err());
    }

    #[test]
    fn port_spec_accepts_commas_and_ranges() {
        let ports = parse_port_spec("22, 80,3388-3390,22").unwrap();
        assert_eq!(ports, vec![22, 80, 3388, 3389, 3390]);
        assert!(parse_port_spec(" , ").is_err());
        assert!(parse_port_spec("http").is_err());
    }

    #[test]
    fn service_names_fall_back_to_unknown() {
        assert_eq!(service_name(22), "SSH");
        assert_eq!(service_name(3389), "RDP");
        assert_eq!(service_name(54321), "Unknown-54321");
    }

    #[test]
    fn default_covers_privileged_range() {
        let d = default_ports();
        assert_eq!(d.len(), 1024);
        assert_eq!(d.first(), Some(&1));
        assert_eq!(d.last(), Some(&1024));
    }

    #[test]
    fn suspicious_list_is_fixed() {
        assert!(is_suspicious(31337));
        assert!(is_suspicious(25));
        assert!(!is_suspicious(80));
    }
}
