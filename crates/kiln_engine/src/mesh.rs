//! The mesh slot table, the built-in cube, and glTF intake.
//!
//! Slots are append-only: a monotonically increasing cursor hands out
//! table entries up to [`MESH_SLOT_CAP`] and nothing is ever freed before
//! engine teardown. Slot 0 is the unit cube, registered at init. The glTF
//! decoder is external (the `gltf` crate); this module only consumes the
//! position/normal/color/index accessors it produces.

use ash::vk;
use thiserror::Error;

use crate::render::buffer::Buffer;
use crate::render::frame::CommandPool;
use crate::render::context::VulkanContext;
use crate::render::VulkanError;

/// Capacity of the mesh table, slot 0 included.
pub const MESH_SLOT_CAP: usize = 64;

/// Interleaved vertex layout of the mesh pipeline: position, normal,
/// color at binding 0, locations 0/1/2.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshVertex {
    /// Object-space position.
    pub position: [f32; 3],
    /// Object-space normal.
    pub normal: [f32; 3],
    /// RGBA vertex color.
    pub color: [f32; 4],
}

/// Mesh loading errors.
#[derive(Error, Debug)]
pub enum MeshError {
    /// The mesh file could not be read.
    #[error("mesh file {0}: {1}")]
    Io(String, std::io::Error),

    /// The glTF decoder rejected the file.
    #[error("glTF decode failed: {0}")]
    Decode(String),

    /// The file parsed but produced no usable geometry.
    #[error("glTF file contains no geometry")]
    EmptyGeometry,

    /// All mesh slots are in use.
    #[error("mesh table full ({MESH_SLOT_CAP} slots)")]
    SlotsExhausted,

    /// GPU buffer creation or upload failed.
    #[error("mesh upload failed: {0}")]
    Gpu(#[from] VulkanError),
}

/// GPU residency for one loaded mesh.
pub struct LoadedMesh {
    /// Device-local vertex buffer.
    pub vertex_buffer: Buffer,
    /// Device-local index buffer (u32 indices).
    pub index_buffer: Buffer,
    /// Number of indices to draw.
    pub index_count: u32,
    /// Number of vertices (diagnostics).
    pub vertex_count: u32,
}

/// Fixed-size table of mesh slots. Append-only after init.
pub struct MeshTable {
    slots: Vec<Option<LoadedMesh>>,
    next_slot: usize,
}

impl Default for MeshTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshTable {
    /// An empty table; the engine registers the cube into slot 0 at init.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MESH_SLOT_CAP);
        slots.resize_with(MESH_SLOT_CAP, || None);
        Self {
            slots,
            next_slot: 0,
        }
    }

    /// Register a mesh in the next free slot and return its handle.
    pub fn register(&mut self, mesh: LoadedMesh) -> Result<u32, MeshError> {
        if self.next_slot >= MESH_SLOT_CAP {
            return Err(MeshError::SlotsExhausted);
        }
        let handle = self.next_slot as u32;
        self.slots[self.next_slot] = Some(mesh);
        self.next_slot += 1;
        Ok(handle)
    }

    /// Look up a loaded slot. Out-of-range and unloaded handles are
    /// `None`; the recorder skips them.
    pub fn get(&self, handle: u32) -> Option<&LoadedMesh> {
        self.slots.get(handle as usize)?.as_ref()
    }

    /// Number of slots handed out so far.
    pub fn len(&self) -> usize {
        self.next_slot
    }

    /// Whether no slot has been handed out yet.
    pub fn is_empty(&self) -> bool {
        self.next_slot == 0
    }
}

/// Decode a glTF/GLB byte blob into the vertex/index arrays the mesh
/// pipeline consumes. Missing normals default to +Z, missing colors to
/// white; missing indices become a trivial 0..n index list.
pub fn decode_gltf(bytes: &[u8]) -> Result<(Vec<MeshVertex>, Vec<u32>), MeshError> {
    let (document, buffers, _images) =
        gltf::import_slice(bytes).map_err(|e| MeshError::Decode(e.to_string()))?;

    let mesh = document.meshes().next().ok_or(MeshError::EmptyGeometry)?;
    let primitive = mesh.primitives().next().ok_or(MeshError::EmptyGeometry)?;
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));

    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .ok_or(MeshError::EmptyGeometry)?
        .collect();
    if positions.is_empty() {
        return Err(MeshError::EmptyGeometry);
    }

    let normals: Option<Vec<[f32; 3]>> = reader.read_normals().map(|iter| iter.collect());
    let colors: Option<Vec<[f32; 4]>> = reader
        .read_colors(0)
        .map(|iter| iter.into_rgba_f32().collect());

    let vertices: Vec<MeshVertex> = positions
        .iter()
        .enumerate()
        .map(|(i, &position)| MeshVertex {
            position,
            normal: normals
                .as_ref()
                .and_then(|n| n.get(i).copied())
                .unwrap_or([0.0, 0.0, 1.0]),
            color: colors
                .as_ref()
                .and_then(|c| c.get(i).copied())
                .unwrap_or([1.0, 1.0, 1.0, 1.0]),
        })
        .collect();

    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..vertices.len() as u32).collect(),
    };
    if indices.is_empty() {
        return Err(MeshError::EmptyGeometry);
    }
    // Reject indices that point outside the vertex array.
    if indices.iter().any(|&i| i as usize >= vertices.len()) {
        return Err(MeshError::Decode("index out of range".to_string()));
    }

    Ok((vertices, indices))
}

/// Upload decoded geometry into device-local buffers via the staged path.
pub fn upload_mesh(
    context: &VulkanContext,
    upload_pool: &CommandPool,
    vertices: &[MeshVertex],
    indices: &[u32],
) -> Result<LoadedMesh, MeshError> {
    let memory_properties = context.memory_properties();
    let vertex_bytes = unsafe {
        std::slice::from_raw_parts(
            vertices.as_ptr() as *const u8,
            std::mem::size_of_val(vertices),
        )
    };
    let index_bytes = unsafe {
        std::slice::from_raw_parts(indices.as_ptr() as *const u8, std::mem::size_of_val(indices))
    };

    let vertex_buffer = Buffer::device_local_with_data(
        context.raw_device(),
        &memory_properties,
        upload_pool.handle(),
        context.device.graphics_queue,
        vk::BufferUsageFlags::VERTEX_BUFFER,
        vertex_bytes,
    )?;
    let index_buffer = Buffer::device_local_with_data(
        context.raw_device(),
        &memory_properties,
        upload_pool.handle(),
        context.device.graphics_queue,
        vk::BufferUsageFlags::INDEX_BUFFER,
        index_bytes,
    )?;

    Ok(LoadedMesh {
        vertex_buffer,
        index_buffer,
        index_count: indices.len() as u32,
        vertex_count: vertices.len() as u32,
    })
}

/// The built-in unit cube: half-extent 0.5, per-face normals, white
/// vertex color, faces wound counter-clockwise viewed from outside.
pub fn unit_cube() -> (Vec<MeshVertex>, Vec<u32>) {
    // (normal, four corners in CCW order viewed from outside)
    const FACES: [([f32; 3], [[f32; 3]; 4]); 6] = [
        // +Z
        (
            [0.0, 0.0, 1.0],
            [
                [-0.5, -0.5, 0.5],
                [0.5, -0.5, 0.5],
                [0.5, 0.5, 0.5],
                [-0.5, 0.5, 0.5],
            ],
        ),
        // -Z
        (
            [0.0, 0.0, -1.0],
            [
                [0.5, -0.5, -0.5],
                [-0.5, -0.5, -0.5],
                [-0.5, 0.5, -0.5],
                [0.5, 0.5, -0.5],
            ],
        ),
        // +X
        (
            [1.0, 0.0, 0.0],
            [
                [0.5, -0.5, 0.5],
                [0.5, -0.5, -0.5],
                [0.5, 0.5, -0.5],
                [0.5, 0.5, 0.5],
            ],
        ),
        // -X
        (
            [-1.0, 0.0, 0.0],
            [
                [-0.5, -0.5, -0.5],
                [-0.5, -0.5, 0.5],
                [-0.5, 0.5, 0.5],
                [-0.5, 0.5, -0.5],
            ],
        ),
        // +Y
        (
            [0.0, 1.0, 0.0],
            [
                [-0.5, 0.5, 0.5],
                [0.5, 0.5, 0.5],
                [0.5, 0.5, -0.5],
                [-0.5, 0.5, -0.5],
            ],
        ),
        // -Y
        (
            [0.0, -1.0, 0.0],
            [
                [-0.5, -0.5, -0.5],
                [0.5, -0.5, -0.5],
                [0.5, -0.5, 0.5],
                [-0.5, -0.5, 0.5],
            ],
        ),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, corners) in FACES {
        let base = vertices.len() as u32;
        for position in corners {
            vertices.push(MeshVertex {
                position,
                normal,
                color: [1.0, 1.0, 1.0, 1.0],
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_40_bytes_interleaved() {
        assert_eq!(std::mem::size_of::<MeshVertex>(), 40);
        let v = MeshVertex {
            position: [0.0; 3],
            normal: [0.0; 3],
            color: [0.0; 4],
        };
        let base = &v as *const MeshVertex as usize;
        assert_eq!(&v.position as *const _ as usize - base, 0);
        assert_eq!(&v.normal as *const _ as usize - base, 12);
        assert_eq!(&v.color as *const _ as usize - base, 24);
    }

    #[test]
    fn cube_has_per_face_vertices() {
        let (vertices, indices) = unit_cube();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
        // Every position sits on the half-extent shell.
        for v in &vertices {
            assert!(v
                .position
                .iter()
                .all(|&c| (c - 0.5).abs() < 1e-6 || (c + 0.5).abs() < 1e-6));
            // The normal is axis-aligned and unit length.
            let len: f32 = v.normal.iter().map(|n| n * n).sum();
            assert!((len - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn cube_faces_point_outward() {
        let (vertices, indices) = unit_cube();
        for tri in indices.chunks(3) {
            let [a, b, c] = [
                vertices[tri[0] as usize].position,
                vertices[tri[1] as usize].position,
                vertices[tri[2] as usize].position,
            ];
            let ab = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let ac = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            let cross = [
                ab[1] * ac[2] - ab[2] * ac[1],
                ab[2] * ac[0] - ab[0] * ac[2],
                ab[0] * ac[1] - ab[1] * ac[0],
            ];
            let centroid = [
                (a[0] + b[0] + c[0]) / 3.0,
                (a[1] + b[1] + c[1]) / 3.0,
                (a[2] + b[2] + c[2]) / 3.0,
            ];
            let dot: f32 = cross
                .iter()
                .zip(centroid.iter())
                .map(|(n, p)| n * p)
                .sum();
            assert!(dot > 0.0, "triangle winding faces outward (CCW)");
        }
    }

    #[test]
    fn table_hands_out_slots_in_order_and_caps() {
        let mut table = MeshTable::new();
        assert!(table.is_empty());
        assert!(table.get(0).is_none(), "slot 0 unloaded until init fills it");
        assert!(table.get(MESH_SLOT_CAP as u32).is_none());
        assert!(table.get(u32::MAX).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_gltf(b"not a gltf file"),
            Err(MeshError::Decode(_))
        ));
    }
}
