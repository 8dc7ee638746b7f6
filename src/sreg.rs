/// Status Register 1
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister1(pub u8);

impl StatusRegister1 {
    const BUSY: u8 = 0b0000_0001;
    const WEL: u8 = 0b0000_0010;
    const BP_MASK: u8 = 0b0011_1100;

    /// Get BUSY bit.
    pub fn get_busy(&self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_wel(&self) -> bool {
        self.0 & Self::WEL != 0
    }

    /// Get BP[3:0] block protect bits as a nibble.
    pub fn get_block_protect(&self) -> u8 {
        (self.0 & Self::BP_MASK) >> 2
    }

    /// Clear BP[3:0], leaving every other bit untouched.
    pub fn clear_block_protect(&mut self) {
        self.0 &= !Self::BP_MASK;
    }

    /// Get SRP (status register protect) bit.
    pub fn get_srp(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }
}

/// Status Register 2
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister2(pub u8);

impl StatusRegister2 {
    /// Get CMP (protection complement) bit.
    pub fn get_cmp(&self) -> bool {
        self.0 & 0b0100_0000 != 0
    }
}

/// Status Register 3
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister3(pub u8);

impl StatusRegister3 {
    /// Get the current address mode bit.
    ///
    /// Set when the device is decoding 4-byte addresses.
    pub fn get_four_byte_mode(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }
}

#[test]
fn test_status_register_bits() {
    let s1 = StatusRegister1(0b1001_0111);
    assert!(s1.get_busy());
    assert!(s1.get_wel());
    assert_eq!(s1.get_block_protect(), 0b0101);
    assert!(s1.get_srp());

    let mut s1 = StatusRegister1(0xFF);
    s1.clear_block_protect();
    assert_eq!(s1.0, 0b1100_0011);
    assert_eq!(s1.get_block_protect(), 0);

    assert!(StatusRegister3(0x80).get_four_byte_mode());
    assert!(!StatusRegister3(0x7F).get_four_byte_mode());
}
