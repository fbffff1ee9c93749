//! Static threat classification of open ports.

use crate::types::Severity;

/// Remote shells, file transfer, Windows RPC/SMB and databases.
pub const HIGH_RISK_PORTS: &[u16] = &[21, 22, 23, 135, 139, 445, 1433, 1521, 3306, 3389, 5432, 5900];

/// Internet-facing mail, DNS and web.
pub const MEDIUM_RISK_PORTS: &[u16] = &[25, 53, 80, 110, 143, 443, 993, 995];

/// Service-name tokens that mark a high-risk service on a non-standard port.
pub const DANGEROUS_SERVICE_TOKENS: &[&str] =
    &["telnet", "ftp", "ssh", "rdp", "vnc", "mysql", "postgres"];

/// Classify an observed open port.
///
/// Port tiers are checked before the service name, so a well-known port keeps
/// its tier whatever the service banner says. The suspicious flag never
/// changes the severity; it only feeds [`should_block`].
pub fn classify(port: u16, service: &str, _suspicious: bool) -> Severity {
    if HIGH_RISK_PORTS.contains(&port) {
        return Severity::High;
    }
    if MEDIUM_RISK_PORTS.contains(&port) {
        return Severity::Medium;
    }
    let service = service.to_ascii_lowercase();
    if DANGEROUS_SERVICE_TOKENS.iter().any(|t| service.contains(t)) {
        return Severity::High;
    }
    Severity::Low
}

/// Automatic enforcement policy.
pub fn should_block(severity: Severity, suspicious: bool) -> bool {
    match severity {
        Severity::High => true,
        Severity::Medium => suspicious,
        Severity::Low => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_classifications() {
        assert_eq!(classify(22, "ssh", false), Severity::High);
        assert_eq!(classify(80, "http", false), Severity::Medium);
        assert_eq!(classify(54321, "foo", false), Severity::Low);
    }

    #[test]
    fn port_tier_wins_over_service_name() {
        assert_eq!(classify(443, "ssh-over-https", false), Severity::Medium);
        assert_eq!(classify(3306, "Unknown-3306", false), Severity::High);
    }

    #[test]
    fn dangerous_service_on_odd_port_is_high() {
        assert_eq!(classify(2222, "OpenSSH", false), Severity::High);
        assert_eq!(classify(15432, "PostgreSQL", false), Severity::High);
        assert_eq!(classify(5901, "VNC-1", false), Severity::High);
    }

    #[test]
    fn suspicious_does_not_change_severity() {
        for port in [25u16, 80, 4444, 22] {
            assert_eq!(classify(port, "x", true), classify(port, "x", false));
        }
    }

    #[test]
    fn classification_is_total_and_deterministic() {
        for port in (1..=u16::MAX).step_by(7) {
            let a = classify(port, "svc", port % 2 == 0);
            let b = classify(port, "svc", port % 2 == 0);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn block_policy() {
        assert!(should_block(Severity::High, false));
        assert!(should_block(Severity::Medium, true));
        assert!(!should_block(Severity::Medium, false));
        assert!(!should_block(Severity::Low, true));
    }
}
