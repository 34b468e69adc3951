use std::path::Path;

use anyhow::{Result, anyhow, bail};
use obj::{IndexTuple, Obj, ObjData};

/// A triangulated mesh ready for upload: packed float3 positions and uint3
/// index triplets.
#[derive(Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn from_file(filepath: &Path) -> Result<Mesh> {
        let obj: Obj = Obj::load(filepath).map_err(|e| anyhow!("failed to load {}: {e}", filepath.display()))?;
        Mesh::from_obj_data(&obj.data)
    }

    /// Every object and group is merged into one mesh.
    pub fn from_obj_data(obj_data: &ObjData) -> Result<Mesh> {
        let vertices = obj_data.position.clone();
        let mut triangles = Vec::new();

        for object in obj_data.objects.iter() {
            for group in object.groups.iter() {
                for poly in group.polys.iter() {
                    let index_tup_vec: &Vec<IndexTuple> = &poly.0;
                    if index_tup_vec.len() != 3 {
                        bail!("mesh is not triangulated: face with {} vertices in {}", index_tup_vec.len(), object.name);
                    }

                    let mut tri = [0u32; 3];
                    for (corner, tuple) in tri.iter_mut().zip(index_tup_vec) {
                        if tuple.0 >= vertices.len() {
                            bail!("face references vertex {} of {}", tuple.0 + 1, vertices.len());
                        }
                        *corner = u32::try_from(tuple.0)?;
                    }
                    triangles.push(tri);
                }
            }
        }

        Ok(Mesh { vertices, triangles })
    }
}
