use std::{cell::RefCell, env, path::PathBuf, rc::Rc};

use ndarray::Array3;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use volume_generators::{
    FieldId, FieldRef, GeneratorOptions, ImageField, Kernel, ProgrammaticGenerator, SortBy,
    Volume, VolumeGeometry, VolumeLoader, VoxelData, WgpuContext,
};

/// A sphere of soft tissue in air with a few hard noise voxels.
fn synthetic_volume() -> Volume {
    let shape = (32, 96, 96);
    let center = (16.0, 48.0, 48.0);
    let data = Array3::from_shape_fn(shape, |(z, y, x)| {
        let distance = ((z as f32 - center.0).powi(2)
            + (y as f32 - center.1).powi(2)
            + (x as f32 - center.2).powi(2))
        .sqrt();
        let noise = if (x * 7 + y * 13 + z * 17) % 29 == 0 { 60 } else { 0 };
        if distance < 28.0 { 40 + noise } else { -1000 + noise }
    });
    Volume::new(
        VoxelData::Integer(data),
        VolumeGeometry {
            spacing: glam::Vec3::new(0.8, 0.8, 2.5),
            ..Default::default()
        },
    )
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let volume = match env::args().nth(1) {
        Some(directory) => {
            VolumeLoader::load_from_directory(PathBuf::from(directory), SortBy::InstanceNumber)?
        }
        None => synthetic_volume(),
    };
    let mut ctx = WgpuContext::new().await?;

    let smoothed = Rc::new(RefCell::new(ImageField::derived_from(FieldId::next(), &volume)));
    let output: FieldRef = smoothed.clone();
    let source: FieldRef = Rc::new(RefCell::new(ImageField::new(FieldId::next(), volume)));

    let mut generator = ProgrammaticGenerator::new(
        GeneratorOptions {
            input_fields: vec![source],
            output_fields: vec![output],
            integer_representation: true,
            ..Default::default()
        },
        Kernel::bilateral(2, 1.5, 40.0),
    )?;
    let report = generator.generate(&mut ctx)?;
    info!(
        slices = report.slices,
        elapsed_ms = report.elapsed.as_millis() as u64,
        adapter = %ctx.adapter_info().name,
        "volume generated"
    );

    let field = smoothed.borrow();
    let (center, width) = field.window();
    let volume = field.volume();
    if let Some(image) = volume.slice_image(volume.dim().0 / 2, center, width) {
        image.save("result.png")?;
    }
    drop(field);
    generator.dispose(&mut ctx);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        error!(%err, "volume generation failed");
        std::process::exit(1);
    }
}
