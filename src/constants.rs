//! Symbolic names for the numeric driver constants that show up in
//! diagnostics (framebuffer status, read formats, texture formats).
//!
//! Only used to make error messages readable, so a linear scan is fine.

/// `(name, value)` pairs. Values are unique so every lookup is unambiguous.
static DRIVER_CONSTANTS: &[(&str, u32)] = &[
    // errors
    ("INVALID_ENUM", 1280),
    ("INVALID_VALUE", 1281),
    ("INVALID_OPERATION", 1282),
    ("OUT_OF_MEMORY", 1285),
    ("INVALID_FRAMEBUFFER_OPERATION", 1286),
    // component types
    ("BYTE", 5120),
    ("UNSIGNED_BYTE", 5121),
    ("SHORT", 5122),
    ("UNSIGNED_SHORT", 5123),
    ("INT", 5124),
    ("UNSIGNED_INT", 5125),
    ("FLOAT", 5126),
    ("HALF_FLOAT", 5131),
    // pixel formats
    ("DEPTH_COMPONENT", 6402),
    ("RED", 6403),
    ("ALPHA", 6406),
    ("RGB", 6407),
    ("RGBA", 6408),
    ("LUMINANCE", 6409),
    ("LUMINANCE_ALPHA", 6410),
    ("RG", 33319),
    ("RG_INTEGER", 33320),
    ("RED_INTEGER", 36244),
    ("RGB_INTEGER", 36248),
    ("RGBA_INTEGER", 36249),
    // sized internal formats
    ("R8", 33321),
    ("R16F", 33325),
    ("R32F", 33326),
    ("R8I", 33329),
    ("R8UI", 33330),
    ("R16I", 33331),
    ("R16UI", 33332),
    ("R32I", 33333),
    ("R32UI", 33334),
    ("RGBA32F", 34836),
    ("RGB32F", 34837),
    ("RGBA16F", 34842),
    ("RGB16F", 34843),
    ("RGBA32I", 36226),
    ("RGB32I", 36227),
    ("RGBA16I", 36232),
    ("RGB16I", 36233),
    // textures
    ("TEXTURE_2D", 3553),
    ("TEXTURE_3D", 32879),
    ("TEXTURE_2D_ARRAY", 35866),
    ("TEXTURE0", 33984),
    ("SAMPLER_3D", 35679),
    ("INT_SAMPLER_3D", 36299),
    ("UNSIGNED_INT_SAMPLER_3D", 36307),
    // shaders and programs
    ("FRAGMENT_SHADER", 35632),
    ("VERTEX_SHADER", 35633),
    ("COMPILE_STATUS", 35713),
    ("LINK_STATUS", 35714),
    ("VALIDATE_STATUS", 35715),
    ("CURRENT_PROGRAM", 35725),
    // uniform types
    ("FLOAT_VEC3", 35665),
    ("FLOAT_VEC4", 35666),
    ("INT_VEC3", 35668),
    ("INT_VEC4", 35669),
    ("FLOAT_MAT3", 35675),
    ("FLOAT_MAT4", 35676),
    // readback
    ("IMPLEMENTATION_COLOR_READ_TYPE", 35738),
    ("IMPLEMENTATION_COLOR_READ_FORMAT", 35739),
    ("READ_BUFFER", 3074),
    ("PACK_ALIGNMENT", 3333),
    ("PIXEL_PACK_BUFFER", 35051),
    // framebuffers
    ("FRAMEBUFFER", 36160),
    ("READ_FRAMEBUFFER", 36008),
    ("DRAW_FRAMEBUFFER", 36009),
    ("FRAMEBUFFER_BINDING", 36006),
    ("FRAMEBUFFER_COMPLETE", 36053),
    ("FRAMEBUFFER_INCOMPLETE_ATTACHMENT", 36054),
    ("FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT", 36055),
    ("FRAMEBUFFER_INCOMPLETE_DIMENSIONS", 36057),
    ("FRAMEBUFFER_UNSUPPORTED", 36061),
    ("FRAMEBUFFER_INCOMPLETE_MULTISAMPLE", 36182),
    ("FRAMEBUFFER_ATTACHMENT_TEXTURE_LAYER", 36052),
    ("MAX_COLOR_ATTACHMENTS", 36063),
    ("MAX_DRAW_BUFFERS", 34852),
    ("COLOR_ATTACHMENT0", 36064),
    ("COLOR_ATTACHMENT1", 36065),
    ("COLOR_ATTACHMENT2", 36066),
    ("COLOR_ATTACHMENT3", 36067),
    ("COLOR_ATTACHMENT4", 36068),
    ("COLOR_ATTACHMENT5", 36069),
    ("COLOR_ATTACHMENT6", 36070),
    ("COLOR_ATTACHMENT7", 36071),
    ("DEPTH_ATTACHMENT", 36096),
    ("STENCIL_ATTACHMENT", 36128),
    // geometry
    ("TRIANGLES", 4),
    ("TRIANGLE_STRIP", 5),
    ("TRIANGLE_FAN", 6),
    ("ARRAY_BUFFER", 34962),
    ("STATIC_DRAW", 35044),
    ("MAX_3D_TEXTURE_SIZE", 32883),
    ("MAX_TEXTURE_IMAGE_UNITS", 34930),
];

/// Reverse lookup of a driver constant, `None` when the value is unknown.
pub fn name_of(value: u32) -> Option<&'static str> {
    DRIVER_CONSTANTS
        .iter()
        .find(|(_, candidate)| *candidate == value)
        .map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{FramebufferStatus, PixelFormat, PixelType};
    use std::collections::HashSet;

    #[test]
    fn values_are_unique() {
        let mut seen = HashSet::new();
        for (name, value) in DRIVER_CONSTANTS {
            assert!(seen.insert(*value), "{name} duplicates value {value}");
        }
    }

    #[test]
    fn resolves_framebuffer_status_names() {
        assert_eq!(
            FramebufferStatus::IncompleteAttachment.name(),
            "FRAMEBUFFER_INCOMPLETE_ATTACHMENT"
        );
        assert_eq!(FramebufferStatus::Complete.name(), "FRAMEBUFFER_COMPLETE");
        assert_eq!(PixelFormat::RgbaInteger.name(), "RGBA_INTEGER");
        assert_eq!(PixelType::HalfFloat.name(), "HALF_FLOAT");
    }

    #[test]
    fn unknown_value_has_no_name() {
        assert_eq!(name_of(0xdead_beef), None);
    }
}
