use std::{
    fmt,
    str::FromStr,
};

use thiserror::Error;

/// A device family. Each family has its own firmware images, stored and
/// queried under the 4-digit hex form of its product ID.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Product {
    MiniDrone,
    ArDrone3,
    JumpingSumo,
    SkyController,
    JumpingSumoEvoLight,
    JumpingSumoEvoRace,
    MiniDroneEvoLight,
    MiniDroneEvoBrick,
    MiniDroneEvoHydrofoil,
    Bebop2,
}

const PRODUCTS: [Product; 10] = [
    Product::MiniDrone,
    Product::ArDrone3,
    Product::JumpingSumo,
    Product::SkyController,
    Product::JumpingSumoEvoLight,
    Product::JumpingSumoEvoRace,
    Product::MiniDroneEvoLight,
    Product::MiniDroneEvoBrick,
    Product::MiniDroneEvoHydrofoil,
    Product::Bebop2,
];

impl Product {
    /// All known products in table order. The downloader visits products in
    /// this order.
    pub fn all() -> &'static [Product] {
        &PRODUCTS
    }

    pub fn id(self) -> u16 {
        match self {
            Self::MiniDrone => 0x0900,
            Self::ArDrone3 => 0x0901,
            Self::JumpingSumo => 0x0902,
            Self::SkyController => 0x0903,
            Self::JumpingSumoEvoLight => 0x0905,
            Self::JumpingSumoEvoRace => 0x0906,
            Self::MiniDroneEvoLight => 0x0907,
            Self::MiniDroneEvoBrick => 0x0909,
            Self::MiniDroneEvoHydrofoil => 0x090a,
            Self::Bebop2 => 0x090c,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        PRODUCTS.iter().copied().find(|p| p.id() == id)
    }

    /// Lower-case 4-digit hex form of the product ID, as used in storage paths
    /// and version check queries.
    pub fn hex(self) -> String {
        format!("{:04x}", self.id())
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::MiniDrone => "Rolling Spider",
            Self::ArDrone3 => "Bebop",
            Self::JumpingSumo => "Jumping Sumo",
            Self::SkyController => "SkyController",
            Self::JumpingSumoEvoLight => "Jumping Night",
            Self::JumpingSumoEvoRace => "Jumping Race",
            Self::MiniDroneEvoLight => "Airborne Night",
            Self::MiniDroneEvoBrick => "Airborne Cargo",
            Self::MiniDroneEvoHydrofoil => "Hydrofoil",
            Self::Bebop2 => "Bebop 2",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.id())
    }
}

impl FromStr for Product {
    type Err = ParseProductError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let id = u16::from_str_radix(digits, 16)
            .map_err(|_| ParseProductError::InvalidId(s.to_owned()))?;

        Self::from_id(id).ok_or(ParseProductError::Unknown(id))
    }
}

#[derive(Debug, Error)]
pub enum ParseProductError {
    #[error("Product ID is not a hex number: {0:?}")]
    InvalidId(String),
    #[error("Unknown product ID: {0:04x}")]
    Unknown(u16),
}
