//! Magic packet construction and transmission.
//!
//! A wake-on-LAN magic packet is 102 bytes: six `0xFF` bytes followed by
//! the target MAC address repeated sixteen times. It is sent as a single
//! best-effort UDP broadcast — no acknowledgment exists at this layer.

use crate::error::ProxyError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::UdpSocket;
use tracing::debug;

/// Total size of a magic packet: 6-byte sync stream + 16 MAC repetitions.
pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// A parsed hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = ProxyError;

    /// Accepts exactly 12 hex digits with optional `:` or `-` separators,
    /// e.g. `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`, or `aabbccddeeff`.
    /// Any other character is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .map(|c| {
                c.to_digit(16)
                    .map(|d| d as u8)
                    .ok_or_else(|| ProxyError::InvalidMac(s.to_string()))
            })
            .collect::<Result<_, _>>()?;
        if digits.len() != 12 {
            return Err(ProxyError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = (digits[2 * i] << 4) | digits[2 * i + 1];
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Build the 102-byte magic packet payload for the given MAC.
pub fn magic_packet(mac: &MacAddr) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFFu8; MAGIC_PACKET_LEN];
    let octets = mac.octets();
    for rep in 0..16 {
        packet[6 + rep * 6..6 + (rep + 1) * 6].copy_from_slice(&octets);
    }
    packet
}

/// Send one magic packet for `mac` to `broadcast_addr` (fire-and-forget).
///
/// Binds an ephemeral socket with broadcast enabled, sends a single
/// datagram, and returns. An `Err` here means the signal never left this
/// host; callers treat that as a failed wake attempt.
pub async fn send_magic_packet(
    mac: &MacAddr,
    broadcast_addr: SocketAddr,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let packet = magic_packet(mac);
    socket.send_to(&packet, broadcast_addr).await?;
    debug!(mac = %mac, dest = %broadcast_addr, "magic packet sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_colon_separated() {
        let mac: MacAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(mac.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn test_parse_mac_dash_and_bare() {
        let dashed: MacAddr = "01-23-45-67-89-ab".parse().unwrap();
        let bare: MacAddr = "0123456789ab".parse().unwrap();
        assert_eq!(dashed, bare);
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!("AA:BB:CC:DD:EE".parse::<MacAddr>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
        assert!("aabbccddeeff00".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_parse_mac_rejects_non_hex_chars() {
        // Multibyte input must come back as an error, never a panic.
        assert!("a\u{00fc}123456789".parse::<MacAddr>().is_err());
        assert!("\u{30de}\u{30c3}\u{30af}".parse::<MacAddr>().is_err());
        // Sign prefixes are not hex digits even though integer parsing
        // would tolerate them.
        assert!("+1+2+3+4+5+6".parse::<MacAddr>().is_err());
        assert!("+a:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_display_roundtrip() {
        let mac: MacAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(mac.to_string().parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac: MacAddr = "01:02:03:04:05:06".parse().unwrap();
        let packet = magic_packet(&mac);
        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|b| *b == 0xFF));
        for rep in 0..16 {
            assert_eq!(&packet[6 + rep * 6..6 + (rep + 1) * 6], &[1, 2, 3, 4, 5, 6]);
        }
    }
}
