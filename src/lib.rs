//! # DICOM-fusion library
//!
//! This crate fuses two tomographic DICOM series into one voxel grid. A fixed
//! (primary) series defines the grid, a moving (secondary) series supplies
//! the values, and a registration transform maps between the two.

//!
//! Built on the dicom-rs ecosystem, the pipeline:
//!  - orders an unordered stack of slices along the slice normal
//!  - loads both series as volumes with an index-to-world mapping
//!  - resolves a (possibly deeply nested, possibly non-invertible) transform
//!    and works out which direction it maps
//!  - resamples the moving volume onto the fixed grid (nearest or trilinear)
//!  - returns one plane as a compact float32 preview payload, or
//!  - writes the whole result as a derived DICOM series plus a JSON manifest
//!
//! Per-file decoding, resampling and writing run in parallel using rayon.
//! Every invocation also returns [`diagnostics::Diagnostics`], an ordered
//! record of skipped slices, inversion fallbacks and direction probing.
//!
//! DICOM files are assumed to have the following attributes:
//!   - No multiframe (always the first frame is used)
//!   - One series per file list, with constant orientation
//!
//! # Examples
//!
//! ## Resampling a secondary series onto a primary grid
//!
//! ```no_run
//! # use dicom_fusion::config::{PreviewConfig, TransformRequest};
//! # use dicom_fusion::pipeline::run_preview;
//! # use std::path::PathBuf;
//! let config = PreviewConfig {
//!     primary: vec![PathBuf::from("ct/0001.dcm"), PathBuf::from("ct/0002.dcm")],
//!     secondary: vec![PathBuf::from("mr/0001.dcm"), PathBuf::from("mr/0002.dcm")],
//!     transform: TransformRequest {
//!         transform_file: Some(PathBuf::from("registration.tfm")),
//!         ..TransformRequest::default()
//!     },
//!     slice_index: 1,
//!     ..PreviewConfig::default()
//! };
//! let response = run_preview(&config).expect("should have resampled the secondary series");
//! println!("{}", serde_json::to_string(&response).unwrap());
//! ```
//!
//! ## Loading a directory as a volume
//!
//! ```no_run
//! # use dicom_fusion::diagnostics::Diagnostics;
//! # use dicom_fusion::volume_loader::VolumeLoader;
//! let mut diagnostics = Diagnostics::new();
//! let volume = VolumeLoader::load_from_directory("primary", "dicom", &mut diagnostics)
//!     .expect("should have loaded files from directory");
//! println!("{:?} uniform={}", volume.size(), volume.spacing_uniform());
//! ```

pub mod config;
pub mod diagnostics;
pub mod enums;
pub mod error;
pub mod export;
pub mod extract;
pub mod header;
mod interpolator;
pub mod metadata;
pub mod pipeline;
pub mod quantize;
pub mod resampler;
pub mod slice;
pub mod slice_order;
pub mod transform;
pub mod volume;
pub mod volume_loader;

pub use error::{FusionError, Result};
