/// Store the ID read off an SPI flash memory.
///
/// The manufacturer ID and (long, 16-bit) device ID are read using the 0x9F command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashID {
    pub manufacturer_id: u8,
    pub device_id: u16,
}

impl FlashID {
    /// Build an ID from the three bytes returned by the 0x9F command.
    pub fn from_bytes(data: [u8; 3]) -> Self {
        FlashID {
            manufacturer_id: data[0],
            device_id: u16::from_be_bytes([data[1], data[2]]),
        }
    }

    /// The full 24-bit JEDEC ID, manufacturer in the top byte.
    pub fn jedec(&self) -> u32 {
        ((self.manufacturer_id as u32) << 16) | self.device_id as u32
    }

    /// Look up a manufacturer name from the JEDEC ID.
    #[cfg(feature = "jep106")]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        match jep106::JEP106Code::new(0, self.manufacturer_id & 0x7F).get() {
            // Winbond acquired NEXCOM and so the ID 0xEF is commonly used for Winbond memory.
            Some(mfn) if mfn == "NEXCOM" => Some("Winbond/NEXCOM"),
            // GigaDevice flash doesn't use a continuation code, so 0xC8 appears as Apple Computer.
            Some(mfn) if mfn == "Apple Computer" => Some("Apple Computer/GigaDevice Semiconductor"),
            Some(mfn) => Some(mfn),
            None => None,
        }
    }

    #[cfg(not(feature = "jep106"))]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        None
    }
}

impl core::fmt::Display for FlashID {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Manufacturer 0x{:02X}", self.manufacturer_id)?;
        if let Some(mfn) = self.manufacturer_name() {
            write!(f, " ({})", mfn)?;
        }
        write!(f, ", Device 0x{:04X}", self.device_id)
    }
}

#[test]
fn test_flash_id_jedec() {
    let id = FlashID::from_bytes([0xEF, 0x40, 0x18]);
    assert_eq!(id.manufacturer_id, 0xEF);
    assert_eq!(id.device_id, 0x4018);
    assert_eq!(id.jedec(), 0xEF4018);
    assert!(id.to_string().contains("Device 0x4018"));
}
