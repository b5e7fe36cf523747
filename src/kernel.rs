//! The compute logic a generator runs for every output pixel.

use glam::{IVec3, Vec3};

use crate::fields::FieldRef;
use crate::shader::wgsl_float;
use crate::uniforms::{UniformDecl, UniformType, Uniforms};

const PIXEL_DIMENSIONS: &str = "pixel_dimensions";
const PIXEL_TO_TEXTURE: &str = "pixel_to_texture";

/// Selects what a [`ProgrammaticGenerator`](crate::ProgrammaticGenerator) computes.
#[derive(Clone, Debug, PartialEq)]
pub enum Kernel {
    /// Adds a slice-dependent sine/cosine pattern to input 0. Output 0 gets
    /// `sample + perturbation`, output 1 `sample - perturbation`, both
    /// converted to the buffer type first so integer outputs truncate the
    /// perturbation on its own. An amplitude of zero passes the input through.
    Synthetic { amplitude: f32, frequency: f32 },
    /// Gaussian convolution over a `(2 * radius + 1)^3` neighborhood.
    Filter { radius: u32, sigma: f32 },
    /// Edge-preserving smoothing weighted by distance and by value difference.
    Bilateral {
        radius: u32,
        sigma_spatial: f32,
        sigma_range: f32,
    },
    /// Resamples input 0 at points displaced by the vectors of input 1.
    Transform,
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::synthetic(1.0, 1.0)
    }
}

impl Kernel {
    pub fn synthetic(amplitude: f32, frequency: f32) -> Self {
        Kernel::Synthetic {
            amplitude,
            frequency,
        }
    }

    pub fn filter(radius: u32, sigma: f32) -> Self {
        Kernel::Filter { radius, sigma }
    }

    pub fn bilateral(radius: u32, sigma_spatial: f32, sigma_range: f32) -> Self {
        Kernel::Bilateral {
            radius,
            sigma_spatial,
            sigma_range,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Kernel::Synthetic { .. } => "synthetic",
            Kernel::Filter { .. } => "filter",
            Kernel::Bilateral { .. } => "bilateral",
            Kernel::Transform => "transform",
        }
    }

    pub fn required_inputs(&self) -> usize {
        match self {
            Kernel::Transform => 2,
            _ => 1,
        }
    }

    fn is_neighborhood(&self) -> bool {
        matches!(self, Kernel::Filter { .. } | Kernel::Bilateral { .. })
    }

    /// Uniforms the kernel body reads, besides the slice.
    pub fn uniform_declarations(&self) -> Vec<UniformDecl> {
        match self {
            Kernel::Synthetic { .. } => vec![
                UniformDecl::new("amplitude", UniformType::Float),
                UniformDecl::new("frequency", UniformType::Float),
            ],
            Kernel::Filter { .. } | Kernel::Bilateral { .. } => vec![
                UniformDecl::new(PIXEL_DIMENSIONS, UniformType::Vec3I),
                UniformDecl::new(PIXEL_TO_TEXTURE, UniformType::Vec3F),
            ],
            Kernel::Transform => Vec::new(),
        }
    }

    /// Values for the kernel's uniforms. Neighborhood kernels step one voxel
    /// of the primary input, so these change whenever that input does.
    pub fn derive_uniforms(&self, inputs: &[FieldRef]) -> Uniforms {
        let mut uniforms = Uniforms::new();
        match self {
            Kernel::Synthetic {
                amplitude,
                frequency,
            } => {
                uniforms.insert("amplitude".to_owned(), (*amplitude).into());
                uniforms.insert("frequency".to_owned(), (*frequency).into());
            }
            _ if self.is_neighborhood() => {
                if let Some(primary) = inputs.first() {
                    let [width, height, depth] = primary.borrow().dimensions();
                    let dimensions = IVec3::new(width as i32, height as i32, depth as i32);
                    uniforms.insert(PIXEL_DIMENSIONS.to_owned(), dimensions.into());
                    uniforms.insert(
                        PIXEL_TO_TEXTURE.to_owned(),
                        (Vec3::ONE / dimensions.as_vec3().max(Vec3::ONE)).into(),
                    );
                }
            }
            _ => {}
        }
        uniforms
    }

    /// Module-scope constants and helpers emitted ahead of the field code.
    pub fn header_source(&self) -> String {
        match self {
            Kernel::Filter { radius, sigma } => format!(
                "const FILTER_RADIUS: i32 = {radius};
const FILTER_SIGMA: f32 = {sigma};

fn gaussian_weight(distance_squared: f32, sigma: f32) -> f32 {{
    return exp(-distance_squared / (2.0 * sigma * sigma));
}}
",
                sigma = wgsl_float(*sigma),
            ),
            Kernel::Bilateral {
                radius,
                sigma_spatial,
                sigma_range,
            } => format!(
                "const BILATERAL_RADIUS: i32 = {radius};
const SIGMA_SPATIAL: f32 = {spatial};
const SIGMA_RANGE: f32 = {range};
const SQRT_2_PI: f32 = 2.5066282746;

fn gaussian(x: f32, sigma: f32) -> f32 {{
    return exp(-(x * x) / (2.0 * sigma * sigma)) / (SQRT_2_PI * sigma);
}}
",
                spatial = wgsl_float(*sigma_spatial),
                range = wgsl_float(*sigma_range),
            ),
            Kernel::Synthetic { .. } | Kernel::Transform => String::new(),
        }
    }

    /// The fragment entry point writing `outputs` color targets.
    pub fn compute_source(&self, outputs: usize) -> String {
        let (body, writes) = match self {
            Kernel::Synthetic { .. } => (
                "    let perturbation = 10.0 * ${amplitude} * ${slice}
        * (sin(${frequency} * stp.x) + cos(${frequency} * stp.y));
    let value = ${input0.texel}(stp).r;
",
                (0..outputs)
                    .map(|target| match target {
                        0 => "Buffer(value) + Buffer(perturbation)",
                        1 => "Buffer(value) - Buffer(perturbation)",
                        _ => "value",
                    })
                    .collect::<Vec<_>>(),
            ),
            Kernel::Filter { .. } => (
                "    var total = 0.0;
    var weights = 0.0;
    for (var k = -FILTER_RADIUS; k <= FILTER_RADIUS; k = k + 1) {
        for (var j = -FILTER_RADIUS; j <= FILTER_RADIUS; j = j + 1) {
            for (var i = -FILTER_RADIUS; i <= FILTER_RADIUS; i = i + 1) {
                let offset = vec3<f32>(f32(i), f32(j), f32(k));
                let weight = gaussian_weight(dot(offset, offset), FILTER_SIGMA);
                total = total + weight * ${input0.texel}(stp + offset * ${pixel_to_texture}).r;
                weights = weights + weight;
            }
        }
    }
    let value = total / weights;
",
                vec!["value"; outputs],
            ),
            Kernel::Bilateral { .. } => (
                "    let center = ${input0.texel}(stp).r;
    var total = 0.0;
    var weights = 0.0;
    for (var k = -BILATERAL_RADIUS; k <= BILATERAL_RADIUS; k = k + 1) {
        for (var j = -BILATERAL_RADIUS; j <= BILATERAL_RADIUS; j = j + 1) {
            for (var i = -BILATERAL_RADIUS; i <= BILATERAL_RADIUS; i = i + 1) {
                let offset = vec3<f32>(f32(i), f32(j), f32(k));
                let neighbor = ${input0.texel}(stp + offset * ${pixel_to_texture}).r;
                let weight = gaussian(length(offset), SIGMA_SPATIAL)
                    * gaussian(neighbor - center, SIGMA_RANGE);
                total = total + weight * neighbor;
                weights = weights + weight;
            }
        }
    }
    let value = select(center, total / weights, weights > 0.0);
",
                vec!["value"; outputs],
            ),
            Kernel::Transform => (
                "    let point = ${input0.texture_to_patient}(stp);
    let displacement = ${input1.sample_field}(point).normal;
    let value = ${input0.sample_field}(point + displacement).value;
",
                vec!["value"; outputs],
            ),
        };

        let mut source = String::from(
            "@fragment
fn main(varyings: VertexOutput) -> FragmentOutput {
    let stp = varyings.texture_coordinate;
",
        );
        source.push_str(body);
        source.push_str("    var result: FragmentOutput;\n");
        for (target, expression) in writes.iter().enumerate() {
            source.push_str(&format!(
                "    result.output{target} = vec4<Buffer>(Buffer({expression}));\n"
            ));
        }
        source.push_str("    return result;\n}\n");
        source
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use ndarray::Array3;

    use super::*;
    use crate::fields::{FieldId, ImageField};
    use crate::uniforms::UniformValue;
    use crate::volume::{Volume, VolumeGeometry, VoxelData};

    fn input(shape: (usize, usize, usize)) -> FieldRef {
        Rc::new(RefCell::new(ImageField::new(
            FieldId::next(),
            Volume::new(
                VoxelData::Float(Array3::zeros(shape)),
                VolumeGeometry::default(),
            ),
        )))
    }

    #[test]
    fn neighborhood_kernels_scale_by_input_dimensions() {
        let uniforms = Kernel::filter(1, 1.0).derive_uniforms(&[input((4, 8, 16))]);
        assert_eq!(
            uniforms.get(PIXEL_DIMENSIONS),
            Some(&UniformValue::Vec3I([16, 8, 4]))
        );
        assert_eq!(
            uniforms.get(PIXEL_TO_TEXTURE),
            Some(&UniformValue::Vec3F([1.0 / 16.0, 1.0 / 8.0, 0.25]))
        );
    }

    #[test]
    fn synthetic_publishes_its_parameters() {
        let uniforms = Kernel::synthetic(0.5, 3.0).derive_uniforms(&[]);
        assert_eq!(uniforms.get("amplitude"), Some(&UniformValue::Float(0.5)));
        assert_eq!(uniforms.get("frequency"), Some(&UniformValue::Float(3.0)));
    }

    #[test]
    fn synthetic_converts_the_perturbation_before_applying_it() {
        let source = Kernel::synthetic(1.0, 1.0).compute_source(2);
        assert!(source.contains(
            "result.output0 = vec4<Buffer>(Buffer(Buffer(value) + Buffer(perturbation)));"
        ));
        assert!(source.contains(
            "result.output1 = vec4<Buffer>(Buffer(Buffer(value) - Buffer(perturbation)));"
        ));
    }

    #[test]
    fn bilateral_parameters_become_constants() {
        let header = Kernel::bilateral(3, 2.0, 50.0).header_source();
        assert!(header.contains("const BILATERAL_RADIUS: i32 = 3;"));
        assert!(header.contains("const SIGMA_SPATIAL: f32 = 2.0;"));
        assert!(header.contains("const SIGMA_RANGE: f32 = 50.0;"));
    }

    #[test]
    fn transform_needs_two_inputs() {
        assert_eq!(Kernel::Transform.required_inputs(), 2);
        assert!(Kernel::Transform.derive_uniforms(&[]).is_empty());
    }
}
