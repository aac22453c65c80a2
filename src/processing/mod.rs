pub mod align_meshes;
pub mod process_batch;
pub mod procrustes;
pub mod transform;
