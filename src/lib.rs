//! # Volume generators
//!
//! This crate renders derived 3D volumes on the GPU. A generator binds a set
//! of input fields (image volumes, displacement grids) and renders a kernel
//! into one or more output fields, one depth slice per full-screen pass.
//! Each slice is read back into the output's host storage, so generated
//! volumes can be used like volumes loaded from disk.
//!
//! Every field describes how it is sampled through a
//! [`SamplingDescriptor`](shader::SamplingDescriptor). The generator composes
//! these descriptors and the kernel into one WGSL program, namespacing the
//! symbols of each field by its id. The uniform block layout follows from
//! the same descriptors.
//!
//! Readback negotiates the pixel layout per attachment. When the driver can
//! not return slices in the layout of the host storage, slices are read as
//! four components and narrowed on the CPU. This is logged once per
//! attachment.
//!
//! Integer volumes (`i16`, e.g. CT in Hounsfield units) and float volumes
//! (`f32`) are supported. A generator works in exactly one of them.
//!
//! # Examples
//!
//! ## Smoothing a DICOM series
//!
//! Load all DICOM files from the dicom/ directory and render an edge
//! preserving smoothed copy of it.
//!
//! ```no_run
//! # use std::{cell::RefCell, rc::Rc};
//! # use volume_generators::{
//! #     FieldId, FieldRef, GeneratorOptions, ImageField, Kernel, ProgrammaticGenerator,
//! #     SortBy, VolumeLoader, WgpuContext,
//! # };
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = WgpuContext::new().await?;
//! let volume = VolumeLoader::load_from_directory("dicom", SortBy::InstanceNumber)?;
//! let smoothed = Rc::new(RefCell::new(ImageField::derived_from(FieldId::next(), &volume)));
//! let source: FieldRef = Rc::new(RefCell::new(ImageField::new(FieldId::next(), volume)));
//! let output: FieldRef = smoothed.clone();
//!
//! let mut generator = ProgrammaticGenerator::new(
//!     GeneratorOptions {
//!         input_fields: vec![source],
//!         output_fields: vec![output],
//!         integer_representation: true,
//!         ..Default::default()
//!     },
//!     Kernel::bilateral(2, 1.5, 40.0),
//! )?;
//! generator.generate(&mut ctx)?;
//! let (center, width) = smoothed.borrow().window();
//! let volume = smoothed.borrow().volume().clone();
//! if let Some(image) = volume.slice_image(volume.dim().0 / 2, center, width) {
//!     image.save("smoothed.png")?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod context;
pub mod enums;
pub mod error;
pub mod fields;
pub mod generator;
pub mod kernel;
pub mod programmatic;
pub mod readback;
pub mod reference;
pub mod shader;
pub mod uniforms;
pub mod volume;
pub mod volume_loader;
pub mod wgpu_context;

pub use context::GpuContext;
pub use enums::{Representation, SortBy};
pub use error::{GeneratorError, GpuError};
pub use fields::{Field, FieldId, FieldRef, ImageField, TransformField};
pub use generator::{Generator, GeneratorOptions};
pub use kernel::Kernel;
pub use programmatic::{GenerationReport, GeneratorState, ProgrammaticGenerator};
pub use volume::{Volume, VolumeGeometry, VoxelData};
pub use volume_loader::VolumeLoader;
pub use wgpu_context::WgpuContext;
