//! Static table of supported flash parts, keyed by JEDEC ID.

/// Number of address bytes used in read, program and erase commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressWidth {
    Three,
    Four,
}

impl AddressWidth {
    pub fn bytes(self) -> usize {
        match self {
            AddressWidth::Three => 3,
            AddressWidth::Four => 4,
        }
    }
}

/// Geometry and addressing requirements of one flash part.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashModel {
    pub name: &'static str,
    /// 24-bit JEDEC ID: manufacturer << 16 | memory type << 8 | capacity.
    pub jedec_id: u32,
    /// Total capacity in bytes.
    pub capacity: u32,
    pub address_width: AddressWidth,
    /// If true, Init must send the enter-4-byte-mode instruction.
    pub requires_four_byte_mode: bool,
    pub page_size: u32,
    pub sector_size: u32,
}

impl FlashModel {
    const fn new(name: &'static str, jedec_id: u32, mib: u32, four_byte: bool) -> Self {
        FlashModel {
            name,
            jedec_id,
            capacity: mib * 1024 * 1024,
            address_width: if four_byte { AddressWidth::Four } else { AddressWidth::Three },
            requires_four_byte_mode: four_byte,
            page_size: 256,
            sector_size: 4096,
        }
    }
}

pub const W25Q16: FlashModel = FlashModel::new("W25Q16", 0xEF4015, 2, false);
pub const W25Q32: FlashModel = FlashModel::new("W25Q32", 0xEF4016, 4, false);
pub const W25Q64: FlashModel = FlashModel::new("W25Q64", 0xEF4017, 8, false);
pub const GD25Q64: FlashModel = FlashModel::new("GD25Q64", 0xC84017, 8, false);
pub const W25Q128: FlashModel = FlashModel::new("W25Q128", 0xEF4018, 16, true);
pub const W25Q256: FlashModel = FlashModel::new("W25Q256", 0xEF4019, 32, true);

/// All parts recognised by `ModelSelection::Detect`.
pub static MODELS: &[FlashModel] = &[W25Q16, W25Q32, W25Q64, GD25Q64, W25Q128, W25Q256];

/// Find the table entry for a 24-bit JEDEC ID.
pub fn lookup(jedec_id: u32) -> Option<&'static FlashModel> {
    MODELS.iter().find(|model| model.jedec_id == jedec_id)
}

/// How Init resolves the chip geometry.
#[derive(Copy, Clone, Debug)]
pub enum ModelSelection {
    /// Look the JEDEC ID up in `MODELS`; unknown IDs fail Init.
    Detect,
    /// Use this model whatever ID the chip reports.
    Fixed(&'static FlashModel),
}

impl Default for ModelSelection {
    fn default() -> Self {
        ModelSelection::Detect
    }
}
