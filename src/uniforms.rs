//! Typed uniform values and the block layout a compiled program exposes.
//!
//! All uniforms of a program live in one WGSL struct bound at
//! `@group(0) @binding(0)`. Offsets follow the uniform address space rules
//! (vec3, vec4 and matrix columns are 16-byte aligned).

use std::collections::BTreeMap;

use glam::{IVec3, IVec4, Mat3, Mat4, Vec3, Vec4};
use tracing::trace;

use crate::error::CodegenError;

/// Name of the per-slice uniform consumed by the vertex stage.
pub const SLICE_UNIFORM: &str = "slice";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformType {
    Vec3F,
    Vec3I,
    Vec4F,
    Vec4I,
    Float,
    UInt,
    Int,
    Mat3,
    Mat4,
}

impl UniformType {
    pub fn wgsl(self) -> &'static str {
        match self {
            UniformType::Vec3F => "vec3<f32>",
            UniformType::Vec3I => "vec3<i32>",
            UniformType::Vec4F => "vec4<f32>",
            UniformType::Vec4I => "vec4<i32>",
            UniformType::Float => "f32",
            UniformType::UInt => "u32",
            UniformType::Int => "i32",
            UniformType::Mat3 => "mat3x3<f32>",
            UniformType::Mat4 => "mat4x4<f32>",
        }
    }

    fn align(self) -> usize {
        match self {
            UniformType::Float | UniformType::UInt | UniformType::Int => 4,
            _ => 16,
        }
    }

    fn size(self) -> usize {
        match self {
            UniformType::Float | UniformType::UInt | UniformType::Int => 4,
            UniformType::Vec3F | UniformType::Vec3I => 12,
            UniformType::Vec4F | UniformType::Vec4I => 16,
            UniformType::Mat3 => 48,
            UniformType::Mat4 => 64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Vec3F([f32; 3]),
    Vec3I([i32; 3]),
    Vec4F([f32; 4]),
    Vec4I([i32; 4]),
    Float(f32),
    UInt(u32),
    Int(i32),
    /// Column-major.
    Mat3([f32; 9]),
    /// Column-major.
    Mat4([f32; 16]),
}

impl UniformValue {
    pub fn ty(&self) -> UniformType {
        match self {
            UniformValue::Vec3F(_) => UniformType::Vec3F,
            UniformValue::Vec3I(_) => UniformType::Vec3I,
            UniformValue::Vec4F(_) => UniformType::Vec4F,
            UniformValue::Vec4I(_) => UniformType::Vec4I,
            UniformValue::Float(_) => UniformType::Float,
            UniformValue::UInt(_) => UniformType::UInt,
            UniformValue::Int(_) => UniformType::Int,
            UniformValue::Mat3(_) => UniformType::Mat3,
            UniformValue::Mat4(_) => UniformType::Mat4,
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::Int(value)
    }
}

impl From<u32> for UniformValue {
    fn from(value: u32) -> Self {
        UniformValue::UInt(value)
    }
}

impl From<Vec3> for UniformValue {
    fn from(value: Vec3) -> Self {
        UniformValue::Vec3F(value.to_array())
    }
}

impl From<IVec3> for UniformValue {
    fn from(value: IVec3) -> Self {
        UniformValue::Vec3I(value.to_array())
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        UniformValue::Vec4F(value.to_array())
    }
}

impl From<IVec4> for UniformValue {
    fn from(value: IVec4) -> Self {
        UniformValue::Vec4I(value.to_array())
    }
}

impl From<Mat3> for UniformValue {
    fn from(value: Mat3) -> Self {
        UniformValue::Mat3(value.to_cols_array())
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        UniformValue::Mat4(value.to_cols_array())
    }
}

/// Named uniform values, kept sorted so iteration is deterministic.
pub type Uniforms = BTreeMap<String, UniformValue>;

/// A uniform the shader source declares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformDecl {
    pub name: String,
    pub ty: UniformType,
}

impl UniformDecl {
    pub fn new(name: impl Into<String>, ty: UniformType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformLocation {
    pub offset: usize,
    pub ty: UniformType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct UniformMember {
    name: String,
    location: UniformLocation,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UniformLayout {
    members: Vec<UniformMember>,
    size: usize,
}

fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

impl UniformLayout {
    /// Lays out the declarations in order. Fails on repeated names.
    pub fn new(declarations: &[UniformDecl]) -> Result<Self, CodegenError> {
        let mut members: Vec<UniformMember> = Vec::with_capacity(declarations.len());
        let mut end = 0;
        for declaration in declarations {
            if members.iter().any(|member| member.name == declaration.name) {
                return Err(CodegenError::DuplicateSymbol(declaration.name.clone()));
            }
            let offset = align_to(end, declaration.ty.align());
            end = offset + declaration.ty.size();
            members.push(UniformMember {
                name: declaration.name.clone(),
                location: UniformLocation {
                    offset,
                    ty: declaration.ty,
                },
            });
        }
        Ok(Self {
            members,
            size: align_to(end.max(1), 16),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn location(&self, name: &str) -> Option<UniformLocation> {
        self.members
            .iter()
            .find(|member| member.name == name)
            .map(|member| member.location)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|member| member.name.as_str())
    }

    /// The `Uniforms` struct declaration shared by both stages.
    pub fn wgsl_struct(&self) -> String {
        let mut source = String::from("struct Uniforms {\n");
        for member in &self.members {
            source.push_str(&format!(
                "    {}: {},\n",
                member.name,
                member.location.ty.wgsl()
            ));
        }
        source.push_str("}\n");
        source
    }

    pub fn new_block(&self) -> UniformBlock {
        UniformBlock {
            bytes: vec![0; self.size],
        }
    }
}

/// Value written to a location of a different type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformTypeMismatch {
    pub declared: UniformType,
    pub given: UniformType,
}

/// CPU copy of a program's uniform buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformBlock {
    bytes: Vec<u8>,
}

impl UniformBlock {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn put<T: bytemuck::Pod>(&mut self, offset: usize, values: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write(
        &mut self,
        location: UniformLocation,
        value: &UniformValue,
    ) -> Result<(), UniformTypeMismatch> {
        if location.ty != value.ty() {
            return Err(UniformTypeMismatch {
                declared: location.ty,
                given: value.ty(),
            });
        }
        let offset = location.offset;
        match value {
            UniformValue::Vec3F(v) => self.put(offset, v),
            UniformValue::Vec3I(v) => self.put(offset, v),
            UniformValue::Vec4F(v) => self.put(offset, v),
            UniformValue::Vec4I(v) => self.put(offset, v),
            UniformValue::Float(v) => self.put(offset, &[*v]),
            UniformValue::UInt(v) => self.put(offset, &[*v]),
            UniformValue::Int(v) => self.put(offset, &[*v]),
            // each column starts on a 16-byte boundary
            UniformValue::Mat3(m) => {
                for (column, values) in m.chunks_exact(3).enumerate() {
                    self.put(offset + 16 * column, values);
                }
            }
            UniformValue::Mat4(m) => self.put(offset, m),
        }
        trace!(offset, ty = ?location.ty, "uniform written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decls(items: &[(&str, UniformType)]) -> Vec<UniformDecl> {
        items
            .iter()
            .map(|(name, ty)| UniformDecl::new(*name, *ty))
            .collect()
    }

    #[test]
    fn offsets_follow_uniform_alignment() {
        let layout = UniformLayout::new(&decls(&[
            ("slice", UniformType::Float),
            ("pixel_dimensions", UniformType::Vec3I),
            ("amplitude", UniformType::Float),
            ("normal_matrix", UniformType::Mat3),
            ("visible", UniformType::Int),
            ("transform", UniformType::Mat4),
        ]))
        .unwrap();

        let offset = |name| layout.location(name).unwrap().offset;
        assert_eq!(offset("slice"), 0);
        assert_eq!(offset("pixel_dimensions"), 16);
        // a scalar packs into the tail of a vec3
        assert_eq!(offset("amplitude"), 28);
        assert_eq!(offset("normal_matrix"), 32);
        assert_eq!(offset("visible"), 80);
        assert_eq!(offset("transform"), 96);
        assert_eq!(layout.size(), 160);
    }

    #[test]
    fn rejects_repeated_names() {
        let result = UniformLayout::new(&decls(&[
            ("visible_1", UniformType::Int),
            ("visible_1", UniformType::Int),
        ]));
        assert_eq!(
            result,
            Err(CodegenError::DuplicateSymbol("visible_1".to_owned()))
        );
    }

    #[test]
    fn mat3_columns_are_padded() {
        let layout = UniformLayout::new(&decls(&[("m", UniformType::Mat3)])).unwrap();
        let mut block = layout.new_block();
        let location = layout.location("m").unwrap();
        block
            .write(location, &UniformValue::from(Mat3::from_cols_array(&[
                1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0,
            ])))
            .unwrap();
        let floats: &[f32] = bytemuck::cast_slice(block.as_bytes());
        assert_eq!(&floats[0..3], &[1.0, 2.0, 3.0]);
        assert_eq!(&floats[4..7], &[4.0, 5.0, 6.0]);
        assert_eq!(&floats[8..11], &[7.0, 8.0, 9.0]);
    }

    #[test]
    fn type_mismatch_leaves_block_untouched() {
        let layout = UniformLayout::new(&decls(&[("amplitude", UniformType::Float)])).unwrap();
        let mut block = layout.new_block();
        let before = block.clone();
        let result = block.write(layout.location("amplitude").unwrap(), &UniformValue::Int(3));
        assert_eq!(
            result,
            Err(UniformTypeMismatch {
                declared: UniformType::Float,
                given: UniformType::Int
            })
        );
        assert_eq!(block, before);
    }

    #[test]
    fn struct_source_lists_members_in_order() {
        let layout = UniformLayout::new(&decls(&[
            ("slice", UniformType::Float),
            ("pixel_to_texture", UniformType::Vec3F),
        ]))
        .unwrap();
        assert_eq!(
            layout.wgsl_struct(),
            "struct Uniforms {\n    slice: f32,\n    pixel_to_texture: vec3<f32>,\n}\n"
        );
    }
}
