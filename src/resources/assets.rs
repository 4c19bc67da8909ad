//! Mesh and material records supplied by the asset loader

use crate::backend::*;
use crate::error::RenderResult;
use crate::resources::arena::{Arena, MaterialHandle, MeshHandle};
use crate::resources::sampler_cache::{SamplerCache, SamplerConfig};
use crate::scene::Aabb;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

/// CPU-side mesh geometry
#[derive(Debug, Clone)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl MeshData {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| v.position))
    }

    /// Unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = MeshData::new("cube");
        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];
        for (normal, right, up) in faces {
            let base = mesh.vertices.len() as u32;
            let center = normal * 0.5;
            for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
                let position = center + right * (u - 0.5) + up * (0.5 - v);
                mesh.vertices.push(Vertex::new(position, normal, Vec2::new(u, v)));
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// Flat plane on the XZ axis, e.g. one terrain tile
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = MeshData::new("plane");
        let subdivisions = subdivisions.max(1);

        let half_width = width / 2.0;
        let half_depth = depth / 2.0;
        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let px = -half_width + x as f32 * step_x;
                let pz = -half_depth + z as f32 * step_z;
                mesh.vertices.push(Vertex::new(
                    Vec3::new(px, 0.0, pz),
                    Vec3::Y,
                    Vec2::new(x as f32 / subdivisions as f32, z as f32 / subdivisions as f32),
                ));
            }
        }

        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let top_left = z * (subdivisions + 1) + x;
                let top_right = top_left + 1;
                let bottom_left = top_left + subdivisions + 1;
                let bottom_right = bottom_left + 1;

                mesh.indices.extend_from_slice(&[
                    top_left,
                    bottom_left,
                    top_right,
                    top_right,
                    bottom_left,
                    bottom_right,
                ]);
            }
        }

        mesh
    }
}

/// Immutable GPU mesh record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuMesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub vertex_count: u32,
    pub index_count: u32,
    pub material_index: u32,
    pub local_bounds: Aabb,
}

impl GpuMesh {
    /// Upload mesh geometry into new vertex and index buffers
    pub fn upload(backend: &mut dyn GraphicsBackend, mesh: &MeshData, material_index: u32) -> RenderResult<Self> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor::new(
                format!("{}_vertices", mesh.name),
                vertex_bytes.len() as u64,
                BufferUsage::VERTEX | BufferUsage::COPY_DST,
            ),
            vertex_bytes,
        )?;
        let index_buffer = backend.create_buffer_init(
            &BufferDescriptor::new(
                format!("{}_indices", mesh.name),
                index_bytes.len() as u64,
                BufferUsage::INDEX | BufferUsage::COPY_DST,
            ),
            index_bytes,
        )?;
        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count: mesh.vertices.len() as u32,
            index_count: mesh.indices.len() as u32,
            material_index,
            local_bounds: mesh.bounds(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlphaMode {
    #[default]
    Opaque,
    Blend,
}

/// Material record as supplied by the asset loader
#[derive(Debug, Clone)]
pub struct MaterialDesc {
    /// Base color texture; `None` samples a white texel
    pub texture: Option<TextureViewHandle>,
    pub sampler: SamplerConfig,
    pub base_color_factor: Vec4,
    /// rgb = color, a = intensity
    pub emissive_factor: Vec4,
    pub alpha_mode: AlphaMode,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            texture: None,
            sampler: SamplerConfig::LINEAR_REPEAT,
            base_color_factor: Vec4::ONE,
            emissive_factor: Vec4::ZERO,
            alpha_mode: AlphaMode::Opaque,
        }
    }
}

impl MaterialDesc {
    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color_factor = color;
        self
    }

    pub fn with_emissive(mut self, color: Vec3, intensity: f32) -> Self {
        self.emissive_factor = color.extend(intensity);
        self
    }

    pub fn with_texture(mut self, texture: TextureViewHandle) -> Self {
        self.texture = Some(texture);
        self
    }
}

/// Material factors as the shaders read them at group 1, binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialUniform {
    pub base_color: Vec4,
    pub emissive: Vec4,
}

#[derive(Debug, Clone)]
pub struct GpuMaterial {
    pub desc: MaterialDesc,
    pub bind_group: BindGroupHandle,
    pub uniform_buffer: BufferHandle,
}

/// Generation-checked storage for meshes and materials
pub struct AssetRegistry {
    meshes: Arena<MeshHandle, GpuMesh>,
    materials: Arena<MaterialHandle, GpuMaterial>,
    white_texture: Option<(TextureHandle, TextureViewHandle)>,
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self {
            meshes: Arena::new("mesh"),
            materials: Arena::new("material"),
            white_texture: None,
        }
    }

    pub fn register_mesh(&mut self, mesh: GpuMesh) -> MeshHandle {
        self.meshes.insert(mesh)
    }

    /// Forget a mesh; its handle resolves to nothing from now on
    pub fn remove_mesh(&mut self, handle: MeshHandle) -> Option<GpuMesh> {
        self.meshes.remove(handle)
    }

    pub fn mesh(&self, handle: MeshHandle) -> Option<&GpuMesh> {
        self.meshes.resolve(handle)
    }

    pub fn contains_mesh(&self, handle: MeshHandle) -> bool {
        self.meshes.contains(handle)
    }

    fn white_texture(&mut self, backend: &mut dyn GraphicsBackend) -> RenderResult<TextureViewHandle> {
        if let Some((_, view)) = self.white_texture {
            return Ok(view);
        }
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some("white".into()),
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        })?;
        backend.write_texture(texture, &[255, 255, 255, 255], 1, 1);
        let view = backend.create_texture_view(texture)?;
        self.white_texture = Some((texture, view));
        Ok(view)
    }

    /// Create the material's uniform buffer and bind group against `layout`
    pub fn register_material(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        layout: BindGroupLayoutHandle,
        samplers: &mut SamplerCache,
        desc: MaterialDesc,
    ) -> RenderResult<MaterialHandle> {
        let texture = match desc.texture {
            Some(view) => view,
            None => self.white_texture(backend)?,
        };
        let sampler = samplers.get_or_create(backend, &desc.sampler)?;
        let uniform = MaterialUniform {
            base_color: desc.base_color_factor,
            emissive: desc.emissive_factor,
        };
        let uniform_buffer = backend.create_buffer_init(
            &BufferDescriptor::new(
                "material_uniform",
                std::mem::size_of::<MaterialUniform>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            ),
            bytemuck::bytes_of(&uniform),
        )?;
        let bind_group = backend.create_bind_group(
            layout,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: uniform_buffer,
                        offset: 0,
                        size: None,
                    },
                ),
                (1, BindGroupEntry::Texture(texture)),
                (2, BindGroupEntry::Sampler(sampler)),
            ],
        )?;
        Ok(self.materials.insert(GpuMaterial {
            desc,
            bind_group,
            uniform_buffer,
        }))
    }

    pub fn remove_material(&mut self, backend: &mut dyn GraphicsBackend, handle: MaterialHandle) -> bool {
        match self.materials.remove(handle) {
            Some(material) => {
                backend.destroy_bind_group(material.bind_group);
                backend.destroy_buffer(material.uniform_buffer);
                true
            }
            None => false,
        }
    }

    pub fn material(&self, handle: MaterialHandle) -> Option<&GpuMaterial> {
        self.materials.resolve(handle)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Destroy everything the registry created; meshes belong to the loader and are only forgotten
    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, material) in self.materials.drain() {
            backend.destroy_bind_group(material.bind_group);
            backend.destroy_buffer(material.uniform_buffer);
        }
        self.meshes.drain().for_each(drop);
        if let Some((texture, view)) = self.white_texture.take() {
            backend.destroy_texture_view(view);
            backend.destroy_texture(texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_bounds() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        let bounds = cube.bounds();
        assert_eq!(bounds.min, Vec3::splat(-0.5));
        assert_eq!(bounds.max, Vec3::splat(0.5));
    }

    #[test]
    fn test_plane_is_flat() {
        let plane = MeshData::plane(2.0, 2.0, 2);
        assert_eq!(plane.vertices.len(), 9);
        assert_eq!(plane.indices.len(), 24);
        assert_eq!(plane.bounds().min.y, 0.0);
        assert_eq!(plane.bounds().max.y, 0.0);
    }

    #[test]
    fn test_removed_mesh_handle_is_stale() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut registry = AssetRegistry::new();
        let mesh = GpuMesh::upload(&mut backend, &MeshData::cube(), 0).unwrap();
        let handle = registry.register_mesh(mesh);
        assert!(registry.mesh(handle).is_some());
        registry.remove_mesh(handle);
        assert!(registry.mesh(handle).is_none());
    }
}
