use core::fmt;

pub const MAC_ADDRESS_SIZE: usize = 6;

/// A 48-bit IEEE 802 MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mac48Address(pub [u8; MAC_ADDRESS_SIZE]);

impl Mac48Address {
    pub const BROADCAST: Mac48Address = Mac48Address([0xff; MAC_ADDRESS_SIZE]);

    pub const fn new(bytes: [u8; MAC_ADDRESS_SIZE]) -> Self {
        Mac48Address(bytes)
    }

    /// A locally administered unicast address whose last two octets are `index`.
    /// Handy for numbering simulated stations.
    pub const fn local(index: u16) -> Self {
        let [hi, lo] = index.to_be_bytes();
        Mac48Address([0x02, 0x00, 0x00, 0x00, hi, lo])
    }

    /// Group (multicast or broadcast) addresses have the I/G bit set.
    pub fn is_group(&self) -> bool {
        (self.0[0] & 0x01) != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<[u8; MAC_ADDRESS_SIZE]> for Mac48Address {
    fn from(bytes: [u8; MAC_ADDRESS_SIZE]) -> Self {
        Mac48Address(bytes)
    }
}

impl fmt::Display for Mac48Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_bits() {
        assert!(Mac48Address::BROADCAST.is_group());
        assert!(Mac48Address::BROADCAST.is_broadcast());
        let multicast = Mac48Address::new([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
        assert!(multicast.is_group());
        assert!(!multicast.is_broadcast());
        assert!(!Mac48Address::local(7).is_group());
    }

    #[test]
    fn test_display() {
        let s = alloc::format!("{}", Mac48Address::local(0x0102));
        assert_eq!(s, "02:00:00:00:01:02");
    }
}
