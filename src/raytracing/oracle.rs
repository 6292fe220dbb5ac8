// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Oráculo de oclusión y visibilidad entre caras de la malla
//!
//! Implementa las dos consultas primitivas del cálculo de factores de forma:
//! oclusión de rayos (test de sombra) y visibilidad entre pares de caras.
//! El trazado puede apoyarse en una BVH en simple precisión o en un árbol
//! AABB en doble precisión (ruta tipo CGAL); ambas rutas devuelven los mismos
//! resultados booleanos módulo la perturbación ε del origen.

use rayon::prelude::*;

use super::bvh::{Bvh, Triangle};
use super::ray::Ray;
use crate::common::{EpsSelf, FluxError, FormFactorConfig, OracleKind, EPS_SELF_DEFAULT};
use crate::geometry::TriMesh;
use crate::{Point3, Vector3};

/// Módulo mínimo de una dirección de rayo. Por debajo se considera nula
const EPS_DIR: f32 = 1e-12;

/// Holgura relativa del parámetro t al verificar que el rayo alcanza la cara destino
const T_SLACK: f32 = 1e-3;

type Point3d = nalgebra::Point3<f64>;

/// Trazador de rayos sobre la malla con perturbación ε de autointersección
pub struct RayTracer<'a> {
    mesh: &'a TriMesh,
    oracle: OracleImpl,
    eps_self: EpsSelf,
    oriented: bool,
    parallel: bool,
}

enum OracleImpl {
    Bvh(Bvh),
    Aabb(AabbTree),
}

impl<'a> RayTracer<'a> {
    /// Construye el trazador con el oráculo indicado en la configuración
    pub fn build(mesh: &'a TriMesh, config: &FormFactorConfig) -> Result<Self, FluxError> {
        if mesh.num_faces() == 0 {
            return Err(FluxError::OracleBuildFailed(
                "la malla no tiene caras".to_string(),
            ));
        }
        let oracle = match config.oracle {
            OracleKind::Bvh => {
                let tris = (0..mesh.num_faces())
                    .map(|i| {
                        let [v0, v1, v2] = mesh.face_vertices(i);
                        Triangle {
                            id: i as u32,
                            v0,
                            v1,
                            v2,
                        }
                    })
                    .collect();
                OracleImpl::Bvh(Bvh::build(tris, 8))
            }
            OracleKind::Aabb => OracleImpl::Aabb(AabbTree::build(mesh)?),
        };
        Ok(Self {
            mesh,
            oracle,
            eps_self: config.eps_self,
            oriented: config.oriented_visibility,
            parallel: config.parallel,
        })
    }

    /// Perturbación ε aplicable al origen de rayos lanzados desde la cara i
    fn eps_for(&self, i: usize) -> f32 {
        match self.eps_self {
            EpsSelf::Global(eps) => eps,
            EpsSelf::SqrtArea => EPS_SELF_DEFAULT * self.mesh.area(i).sqrt(),
        }
    }

    fn any_hit(&self, ray: &Ray, t_max: f32) -> bool {
        match &self.oracle {
            OracleImpl::Bvh(bvh) => bvh.any_hit(ray, t_max, &[]),
            OracleImpl::Aabb(tree) => tree.any_hit(ray, t_max),
        }
    }

    fn closest_hit(&self, ray: &Ray, skip: u32) -> Option<(u32, f32)> {
        match &self.oracle {
            OracleImpl::Bvh(bvh) => bvh.closest_hit(ray, &[skip]),
            OracleImpl::Aabb(tree) => tree.closest_hit(ray, skip),
        }
    }

    /// ¿Queda ocluido el rayo lanzado desde la cara i en la dirección dada?
    ///
    /// El origen es el centroide de la cara perturbado por ε·N. Rayos con
    /// dirección nula se consideran ocluidos (criterio conservador)
    pub fn occluded_one(&self, i: u32, dir: &Vector3) -> bool {
        if dir.norm_squared() < EPS_DIR {
            return true;
        }
        let i = i as usize;
        let origin = self.mesh.centroid(i) + self.eps_for(i) * self.mesh.normal(i);
        let ray = Ray::new(origin, *dir);
        self.any_hit(&ray, f32::INFINITY)
    }

    /// Test de oclusión por lotes desde las caras indicadas
    ///
    /// `dirs` contiene una dirección por cara o una única dirección común.
    /// Las consultas son trivialmente paralelas entre rayos
    pub fn occluded(&self, faces: &[u32], dirs: &[Vector3]) -> Vec<bool> {
        let dir_of = |q: usize| if dirs.len() == 1 { &dirs[0] } else { &dirs[q] };
        if self.parallel {
            faces
                .par_iter()
                .enumerate()
                .map(|(q, &i)| self.occluded_one(i, dir_of(q)))
                .collect()
        } else {
            faces
                .iter()
                .enumerate()
                .map(|(q, &i)| self.occluded_one(i, dir_of(q)))
                .collect()
        }
    }

    /// ¿Está despejado el segmento abierto entre los centroides de i y j?
    ///
    /// Se traza un rayo desde P[i]+εN[i] hacia P[j] y se verifica que la cara
    /// alcanzada es j con t <= ‖P[j]−P[i]‖. Con visibilidad orientada se exige
    /// además que ambas caras se enfrenten. Ninguna cara se ve a sí misma
    pub fn visible(&self, i: u32, j: u32) -> bool {
        if i == j {
            return false;
        }
        let (i, j) = (i as usize, j as usize);
        let d = self.mesh.centroid(j) - self.mesh.centroid(i);
        let r = d.norm();
        if r < EPS_DIR {
            return false;
        }
        if self.oriented {
            // backface culling simétrico: las caras deben enfrentarse
            if d.dot(&self.mesh.normal(i)) <= 0.0 || (-d).dot(&self.mesh.normal(j)) <= 0.0 {
                return false;
            }
        }
        let origin = self.mesh.centroid(i) + self.eps_for(i) * self.mesh.normal(i);
        let ray = Ray::new(origin, d);
        match self.closest_hit(&ray, i as u32) {
            Some((hit, t)) => hit == j as u32 && t <= r * (1.0 + T_SLACK),
            None => false,
        }
    }

    /// Matriz booleana de visibilidad N×N (solo para mallas pequeñas y tests)
    pub fn visibility_matrix(&self) -> nalgebra::DMatrix<bool> {
        let n = self.mesh.num_faces();
        nalgebra::DMatrix::from_fn(n, n, |i, j| self.visible(i as u32, j as u32))
    }

    pub fn mesh(&self) -> &TriMesh {
        self.mesh
    }
}

/// Árbol AABB en doble precisión sobre los triángulos de la malla
///
/// Ruta CPU de estilo CGAL: arena plana de nodos con partición por la mediana
/// de los centroides en el eje más largo. La arena evita grafos de punteros y
/// hace el recorrido amigable con la caché
pub struct AabbTree {
    nodes: Vec<AabbTreeNode>,
    /// Triángulos en doble precisión, en el orden de la permutación del árbol
    tris: Vec<[Point3d; 3]>,
    /// Índice de cara de cada triángulo de `tris`
    ids: Vec<u32>,
}

#[derive(Debug, Copy, Clone)]
struct AabbTreeNode {
    min: [f64; 3],
    max: [f64; 3],
    kind: AabbNodeKind,
}

#[derive(Debug, Copy, Clone)]
enum AabbNodeKind {
    /// Rango [start, end) dentro del array de triángulos
    Leaf { start: u32, end: u32 },
    Inner { left: u32, right: u32 },
}

/// Elementos por hoja del árbol AABB
const AABB_LEAF_SIZE: usize = 8;

impl AabbTree {
    pub fn build(mesh: &TriMesh) -> Result<Self, FluxError> {
        if mesh.num_faces() == 0 {
            return Err(FluxError::OracleBuildFailed(
                "la malla no tiene caras".to_string(),
            ));
        }
        let mut order: Vec<u32> = (0..mesh.num_faces() as u32).collect();
        let tris_by_face: Vec<[Point3d; 3]> = (0..mesh.num_faces())
            .map(|i| {
                let [v0, v1, v2] = mesh.face_vertices(i);
                [to_f64(v0), to_f64(v1), to_f64(v2)]
            })
            .collect();
        let centroids: Vec<[f64; 3]> = tris_by_face
            .iter()
            .map(|[v0, v1, v2]| {
                [
                    (v0.x + v1.x + v2.x) / 3.0,
                    (v0.y + v1.y + v2.y) / 3.0,
                    (v0.z + v1.z + v2.z) / 3.0,
                ]
            })
            .collect();

        let mut nodes = Vec::new();
        Self::build_range(&mut nodes, &mut order, 0, &tris_by_face, &centroids);

        let tris = order
            .iter()
            .map(|&id| tris_by_face[id as usize])
            .collect();
        Ok(Self {
            nodes,
            tris,
            ids: order,
        })
    }

    /// Construye el subárbol del rango order[offset..] y devuelve su índice de nodo
    fn build_range(
        nodes: &mut Vec<AabbTreeNode>,
        order: &mut [u32],
        offset: usize,
        tris: &[[Point3d; 3]],
        centroids: &[[f64; 3]],
    ) -> u32 {
        let (min, max) = bounds_of(order, tris);
        let id = nodes.len() as u32;
        nodes.push(AabbTreeNode {
            min,
            max,
            kind: AabbNodeKind::Leaf {
                start: offset as u32,
                end: (offset + order.len()) as u32,
            },
        });
        if order.len() <= AABB_LEAF_SIZE {
            return id;
        }
        // partición por la mediana en el eje más largo
        let axis = longest_axis(min, max);
        order.sort_unstable_by(|&a, &b| {
            centroids[a as usize][axis]
                .partial_cmp(&centroids[b as usize][axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mid = order.len() / 2;
        let (lo, hi) = order.split_at_mut(mid);
        let left = Self::build_range(nodes, lo, offset, tris, centroids);
        let right = Self::build_range(nodes, hi, offset + mid, tris, centroids);
        nodes[id as usize].kind = AabbNodeKind::Inner { left, right };
        id
    }

    pub fn any_hit(&self, ray: &Ray, t_max: f32) -> bool {
        let (org, dir) = ray_to_f64(ray);
        let mut stack = vec![0u32];
        while let Some(id) = stack.pop() {
            let node = self.nodes[id as usize];
            if !slab_test(&node.min, &node.max, &org, &dir) {
                continue;
            }
            match node.kind {
                AabbNodeKind::Inner { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
                AabbNodeKind::Leaf { start, end } => {
                    for k in start..end {
                        let [v0, v1, v2] = self.tris[k as usize];
                        if let Some(t) = intersect_triangle_f64(&org, &dir, v0, v1, v2) {
                            if t < t_max as f64 {
                                return true;
                            }
                        }
                    }
                }
            }
        }
        false
    }

    pub fn closest_hit(&self, ray: &Ray, skip: u32) -> Option<(u32, f32)> {
        let (org, dir) = ray_to_f64(ray);
        let mut best: Option<(u32, f64)> = None;
        let mut stack = vec![0u32];
        while let Some(id) = stack.pop() {
            let node = self.nodes[id as usize];
            if !slab_test(&node.min, &node.max, &org, &dir) {
                continue;
            }
            match node.kind {
                AabbNodeKind::Inner { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
                AabbNodeKind::Leaf { start, end } => {
                    for k in start..end {
                        if self.ids[k as usize] == skip {
                            continue;
                        }
                        let [v0, v1, v2] = self.tris[k as usize];
                        if let Some(t) = intersect_triangle_f64(&org, &dir, v0, v1, v2) {
                            if best.map_or(true, |(_, tb)| t < tb) {
                                best = Some((self.ids[k as usize], t));
                            }
                        }
                    }
                }
            }
        }
        best.map(|(id, t)| (id, t as f32))
    }
}

fn to_f64(p: Point3) -> Point3d {
    Point3d::new(p.x as f64, p.y as f64, p.z as f64)
}

fn ray_to_f64(ray: &Ray) -> ([f64; 3], [f64; 3]) {
    (
        [
            ray.origin.x as f64,
            ray.origin.y as f64,
            ray.origin.z as f64,
        ],
        [ray.dir.x as f64, ray.dir.y as f64, ray.dir.z as f64],
    )
}

fn bounds_of(order: &[u32], tris: &[[Point3d; 3]]) -> ([f64; 3], [f64; 3]) {
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for &id in order {
        for v in &tris[id as usize] {
            let c = [v.x, v.y, v.z];
            for a in 0..3 {
                min[a] = min[a].min(c[a]);
                max[a] = max[a].max(c[a]);
            }
        }
    }
    (min, max)
}

fn longest_axis(min: [f64; 3], max: [f64; 3]) -> usize {
    let dx = max[0] - min[0];
    let dy = max[1] - min[1];
    let dz = max[2] - min[2];
    if dx >= dy && dx >= dz {
        0
    } else if dy >= dz {
        1
    } else {
        2
    }
}

/// Test de intersección rayo-AABB por slabs en doble precisión
fn slab_test(min: &[f64; 3], max: &[f64; 3], org: &[f64; 3], dir: &[f64; 3]) -> bool {
    let mut tmin = f64::NEG_INFINITY;
    let mut tmax = f64::INFINITY;
    for a in 0..3 {
        let inv = 1.0 / dir[a];
        let t1 = (min[a] - org[a]) * inv;
        let t2 = (max[a] - org[a]) * inv;
        tmin = tmin.max(t1.min(t2));
        tmax = tmax.min(t1.max(t2));
    }
    tmax >= 0.0 && tmin <= tmax
}

/// Möller-Trumbore en doble precisión
fn intersect_triangle_f64(
    org: &[f64; 3],
    dir: &[f64; 3],
    v0: Point3d,
    v1: Point3d,
    v2: Point3d,
) -> Option<f64> {
    const EPS: f64 = 1e-12;
    let dir = nalgebra::Vector3::new(dir[0], dir[1], dir[2]);
    let org = Point3d::new(org[0], org[1], org[2]);
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;
    let pvec = dir.cross(&edge2);
    let det = edge1.dot(&pvec);
    if det.abs() < EPS {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = org - v0;
    let u = tvec.dot(&pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(&edge1);
    let v = dir.dot(&qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(&qvec) * inv_det;
    if t > EPS {
        Some(t)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FormFactorConfig, OracleKind};
    use crate::{point, vector, TriMesh};

    /// Dos triángulos horizontales enfrentados a distancia 1
    fn facing_triangles() -> TriMesh {
        let vertices = vec![
            // inferior, normal +z
            point![0.0, 0.0, 0.0],
            point![1.0, 0.0, 0.0],
            point![0.0, 1.0, 0.0],
            // superior, normal -z
            point![0.0, 0.0, 1.0],
            point![1.0, 0.0, 1.0],
            point![0.0, 1.0, 1.0],
        ];
        let faces = vec![[0, 1, 2], [3, 5, 4]];
        TriMesh::new(vertices, faces).unwrap()
    }

    fn config_with(oracle: OracleKind) -> FormFactorConfig {
        FormFactorConfig {
            oracle,
            parallel: false,
            ..Default::default()
        }
    }

    #[test]
    fn facing_pair_is_visible_with_both_oracles() {
        let mesh = facing_triangles();
        for oracle in [OracleKind::Bvh, OracleKind::Aabb] {
            let tracer = RayTracer::build(&mesh, &config_with(oracle)).unwrap();
            assert!(tracer.visible(0, 1), "oráculo {:?}", oracle);
            assert!(tracer.visible(1, 0), "oráculo {:?}", oracle);
            // ninguna cara se ve a sí misma
            assert!(!tracer.visible(0, 0));
        }
    }

    #[test]
    fn oriented_visibility_rejects_backfacing() {
        let vertices = vec![
            point![0.0, 0.0, 0.0],
            point![1.0, 0.0, 0.0],
            point![0.0, 1.0, 0.0],
            point![0.0, 0.0, 1.0],
            point![1.0, 0.0, 1.0],
            point![0.0, 1.0, 1.0],
        ];
        // ambas caras con normal +z: la superior da la espalda a la inferior
        let faces = vec![[0, 1, 2], [3, 4, 5]];
        let mesh = TriMesh::new(vertices, faces).unwrap();
        let tracer = RayTracer::build(&mesh, &config_with(OracleKind::Bvh)).unwrap();
        assert!(!tracer.visible(0, 1));

        // sin orientación el segmento sí está despejado
        let mut cfg = config_with(OracleKind::Bvh);
        cfg.oriented_visibility = false;
        let tracer = RayTracer::build(&mesh, &cfg).unwrap();
        assert!(tracer.visible(0, 1));
    }

    #[test]
    fn occlusion_against_blocker() {
        // tercer triángulo interpuesto entre los dos enfrentados
        let vertices = vec![
            point![0.0, 0.0, 0.0],
            point![1.0, 0.0, 0.0],
            point![0.0, 1.0, 0.0],
            point![0.0, 0.0, 1.0],
            point![1.0, 0.0, 1.0],
            point![0.0, 1.0, 1.0],
            point![-1.0, -1.0, 0.5],
            point![2.0, -1.0, 0.5],
            point![-1.0, 2.0, 0.5],
        ];
        let faces = vec![[0, 1, 2], [3, 5, 4], [6, 7, 8]];
        let mesh = TriMesh::new(vertices, faces).unwrap();
        for oracle in [OracleKind::Bvh, OracleKind::Aabb] {
            let tracer = RayTracer::build(&mesh, &config_with(oracle)).unwrap();
            assert!(!tracer.visible(0, 1), "oráculo {:?}", oracle);
            // el rayo vertical desde la cara inferior queda ocluido
            assert!(tracer.occluded_one(0, &vector![0.0, 0.0, 1.0]));
            // el rayo horizontal escapa
            assert!(!tracer.occluded_one(0, &vector![1.0, 0.0, 0.0]));
        }
    }

    #[test]
    fn zero_direction_is_occluded() {
        let mesh = facing_triangles();
        let tracer = RayTracer::build(&mesh, &config_with(OracleKind::Bvh)).unwrap();
        assert!(tracer.occluded_one(0, &vector![0.0, 0.0, 0.0]));
    }

    #[test]
    fn batch_occlusion_matches_single_queries() {
        let mesh = facing_triangles();
        let tracer = RayTracer::build(&mesh, &config_with(OracleKind::Bvh)).unwrap();
        let faces = vec![0, 1];
        // direcciones por cara: horizontal para la inferior y descendente para la superior
        let res = tracer.occluded(&faces, &[vector![1.0, 0.0, 0.0], vector![0.0, 0.0, -1.0]]);
        assert_eq!(res.len(), 2);
        // el rayo horizontal escapa; el descendente alcanza la cara inferior
        assert!(!res[0]);
        assert!(res[1]);
        // dirección común: la inferior queda ocluida por la superior
        let res = tracer.occluded(&faces, &[vector![0.0, 0.0, 1.0]]);
        assert!(res[0]);
    }

    #[test]
    fn oracles_agree_on_visibility_matrix() {
        let mesh = facing_triangles();
        let bvh = RayTracer::build(&mesh, &config_with(OracleKind::Bvh)).unwrap();
        let aabb = RayTracer::build(&mesh, &config_with(OracleKind::Aabb)).unwrap();
        assert_eq!(bvh.visibility_matrix(), aabb.visibility_matrix());
    }
}
