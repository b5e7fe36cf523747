use std::fmt;

use crate::constants;

/// Numeric representation a generator works in, chosen once at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Representation {
    Integer,
    #[default]
    Float,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Representation::Integer => f.write_str("integer"),
            Representation::Float => f.write_str("float"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Component layout of a pixel read. Discriminants are the driver constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    Red = 6403,
    Rgba = 6408,
    RedInteger = 36244,
    RgbaInteger = 36249,
}

impl PixelFormat {
    pub fn components(self) -> usize {
        match self {
            PixelFormat::Red | PixelFormat::RedInteger => 1,
            PixelFormat::Rgba | PixelFormat::RgbaInteger => 4,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, PixelFormat::RedInteger | PixelFormat::RgbaInteger)
    }

    pub fn name(self) -> &'static str {
        constants::name_of(self as u32).unwrap_or("UNKNOWN")
    }
}

/// Element type of a pixel read. Discriminants are the driver constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelType {
    Short = 5122,
    Int = 5124,
    Float = 5126,
    HalfFloat = 5131,
}

impl PixelType {
    /// Size of one component in bytes.
    pub fn size(self) -> usize {
        match self {
            PixelType::Short | PixelType::HalfFloat => 2,
            PixelType::Int | PixelType::Float => 4,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, PixelType::Short | PixelType::Int)
    }

    pub fn name(self) -> &'static str {
        constants::name_of(self as u32).unwrap_or("UNKNOWN")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FramebufferStatus {
    Complete = 36053,
    IncompleteAttachment = 36054,
    IncompleteMissingAttachment = 36055,
    IncompleteDimensions = 36057,
    Unsupported = 36061,
}

impl FramebufferStatus {
    pub fn name(self) -> &'static str {
        constants::name_of(self as u32).unwrap_or("UNKNOWN")
    }
}

/// Key used to order the slices of a series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    ImagePositionPatient,
    TablePosition,
    InstanceNumber,
    None,
}
