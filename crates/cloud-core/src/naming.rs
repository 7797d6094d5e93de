//! ID generation and validation helpers, matching the EC2 wire surface's
//! `i-XXXXXXXX` / `vol-XXXXXXXX` / `snap-XXXXXXXX` id conventions.

use crate::error::{CloudError, Result};

/// Validate a user-supplied identifier (project id, user id, security
/// group name, ...): non-empty, ASCII alphanumeric plus `-_.`, max 255.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CloudError::ApiError(format!("{} id must not be empty", kind)));
    }
    if id.len() > 255 {
        return Err(CloudError::ApiError(format!("{} id too long: {}", kind, id)));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(CloudError::ApiError(format!(
            "{} id '{}' contains invalid characters",
            kind, id
        )));
    }
    Ok(())
}

/// Monotonically formats a numeric sequence value into the EC2 id shape
/// `<prefix>-XXXXXXXX` (8 zero-padded hex digits), e.g. `i-00000001`.
pub fn ec2_id(prefix: &str, sequence: u32) -> String {
    format!("{}-{:08x}", prefix, sequence)
}

/// Parses an EC2-shaped id back into its prefix and sequence number.
pub fn parse_ec2_id(id: &str) -> Result<(String, u32)> {
    let (prefix, hex) = id
        .rsplit_once('-')
        .ok_or_else(|| CloudError::ApiError(format!("malformed id: {}", id)))?;
    let sequence = u32::from_str_radix(hex, 16)
        .map_err(|_| CloudError::ApiError(format!("malformed id suffix: {}", id)))?;
    Ok((prefix.to_string(), sequence))
}

/// Generates a random internal instance id (`i-<8 hex>`), independent of
/// the sequence-number EC2 id assigned once persisted.
pub fn generate_instance_id() -> String {
    let bytes: [u8; 4] = rand::random();
    format!("i-{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Generates a reservation id shared by every instance launched in one
/// `RunInstances` call.
pub fn generate_reservation_id() -> String {
    let bytes: [u8; 4] = rand::random();
    format!("r-{:02x}{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Deterministic MAC address for an instance, derived from its numeric
/// sequence so the same instance always gets the same MAC across
/// restarts. High-order byte is fixed to a locally-administered,
/// unicast value (`06`).
pub fn generate_mac(sequence: u32) -> String {
    let b = sequence.to_be_bytes();
    format!(
        "06:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0].wrapping_add(1),
        b[1],
        b[2],
        b[3],
        (sequence % 256) as u8
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_rejects_empty() {
        assert!(validate_id("", "Project").is_err());
    }

    #[test]
    fn validate_id_rejects_bad_chars() {
        assert!(validate_id("acme/evil", "Project").is_err());
    }

    #[test]
    fn validate_id_accepts_normal() {
        validate_id("acme-01", "Project").unwrap();
    }

    #[test]
    fn ec2_id_format_matches_spec_scenario() {
        // first instance minted gets instanceId=i-00000001
        assert_eq!(ec2_id("i", 1), "i-00000001");
    }

    #[test]
    fn ec2_id_round_trips() {
        let id = ec2_id("vol", 42);
        let (prefix, seq) = parse_ec2_id(&id).unwrap();
        assert_eq!(prefix, "vol");
        assert_eq!(seq, 42);
    }

    #[test]
    fn generated_instance_id_has_prefix() {
        let id = generate_instance_id();
        assert!(id.starts_with("i-"));
        assert_eq!(id.len(), 10);
    }

    #[test]
    fn mac_is_deterministic() {
        assert_eq!(generate_mac(7), generate_mac(7));
        assert_ne!(generate_mac(7), generate_mac(8));
    }
}
