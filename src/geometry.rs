// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Malla de triángulos y geometría derivada por cara
//!
//! La malla es inmutable tras su construcción (salvo la reorientación
//! explícita de normales). Los arrays derivados (centroides, normales y
//! áreas) tienen longitud `num_faces` y quedan fijados durante la vida de
//! cualquier operador comprimido construido sobre ella.

use crate::{FluxError, Point3, Vector3};

/// Área mínima aceptada. Por debajo la cara se considera degenerada
pub const EPS_AREA: f32 = 1e-10;

/// Desviación admisible del módulo de una normal suministrada
const EPS_UNIT: f32 = 1e-3;

/// Producto vectorial de los lados de un triángulo, c = (v1-v0) × (v2-v0)
///
/// Su módulo es el doble del área y su dirección la normal de la cara
pub fn face_cross(v0: Point3, v1: Point3, v2: Point3) -> Vector3 {
    (v1 - v0).cross(&(v2 - v0))
}

/// Malla de triángulos con geometría derivada por cara
#[derive(Debug, Clone, PartialEq)]
pub struct TriMesh {
    vertices: Vec<Point3>,
    faces: Vec<[u32; 3]>,
    centroids: Vec<Point3>,
    normals: Vec<Vector3>,
    areas: Vec<f32>,
}

impl TriMesh {
    /// Construye la malla calculando normales a partir de los productos vectoriales
    pub fn new(vertices: Vec<Point3>, faces: Vec<[u32; 3]>) -> Result<Self, FluxError> {
        Self::build(vertices, faces, None)
    }

    /// Construye la malla con normales suministradas por el llamante
    ///
    /// Las normales deben ser unitarias (dentro de tolerancia) y tantas como caras
    pub fn with_normals(
        vertices: Vec<Point3>,
        faces: Vec<[u32; 3]>,
        normals: Vec<Vector3>,
    ) -> Result<Self, FluxError> {
        Self::build(vertices, faces, Some(normals))
    }

    fn build(
        vertices: Vec<Point3>,
        faces: Vec<[u32; 3]>,
        normals: Option<Vec<Vector3>>,
    ) -> Result<Self, FluxError> {
        if let Some(normals) = &normals {
            if normals.len() != faces.len() {
                return Err(FluxError::DegenerateMesh(format!(
                    "se esperaban {} normales y se han recibido {}",
                    faces.len(),
                    normals.len()
                )));
            }
        }

        let num_verts = vertices.len() as u32;
        let mut centroids = Vec::with_capacity(faces.len());
        let mut computed_normals = Vec::with_capacity(faces.len());
        let mut areas = Vec::with_capacity(faces.len());

        for (i, face) in faces.iter().enumerate() {
            for &idx in face {
                if idx >= num_verts {
                    return Err(FluxError::DegenerateMesh(format!(
                        "la cara {} referencia el vértice {} (la malla tiene {})",
                        i, idx, num_verts
                    )));
                }
            }
            let [i0, i1, i2] = *face;
            let (v0, v1, v2) = (
                vertices[i0 as usize],
                vertices[i1 as usize],
                vertices[i2 as usize],
            );
            let cross = face_cross(v0, v1, v2);
            let cross_norm = cross.norm();
            if cross_norm < EPS_AREA {
                return Err(FluxError::DegenerateMesh(format!(
                    "la cara {} es degenerada (área {:e})",
                    i,
                    cross_norm / 2.0
                )));
            }
            centroids.push(Point3::from((v0.coords + v1.coords + v2.coords) / 3.0));
            computed_normals.push(cross / cross_norm);
            areas.push(cross_norm / 2.0);
        }

        let normals = match normals {
            Some(normals) => {
                for (i, n) in normals.iter().enumerate() {
                    if (n.norm() - 1.0).abs() > EPS_UNIT {
                        return Err(FluxError::DegenerateMesh(format!(
                            "la normal de la cara {} no es unitaria (módulo {})",
                            i,
                            n.norm()
                        )));
                    }
                }
                normals
            }
            None => computed_normals,
        };

        Ok(Self {
            vertices,
            faces,
            centroids,
            normals,
            areas,
        })
    }

    /// Número de caras de la malla
    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    /// Número de vértices de la malla
    pub fn num_verts(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[Point3] {
        &self.vertices
    }

    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    pub fn centroids(&self) -> &[Point3] {
        &self.centroids
    }

    pub fn normals(&self) -> &[Vector3] {
        &self.normals
    }

    pub fn areas(&self) -> &[f32] {
        &self.areas
    }

    /// Centroide de la cara i
    pub fn centroid(&self, i: usize) -> Point3 {
        self.centroids[i]
    }

    /// Normal unitaria de la cara i
    pub fn normal(&self, i: usize) -> Vector3 {
        self.normals[i]
    }

    /// Área de la cara i
    pub fn area(&self, i: usize) -> f32 {
        self.areas[i]
    }

    /// Vértices de la cara i
    pub fn face_vertices(&self, i: usize) -> [Point3; 3] {
        let [i0, i1, i2] = self.faces[i];
        [
            self.vertices[i0 as usize],
            self.vertices[i1 as usize],
            self.vertices[i2 as usize],
        ]
    }

    /// Reorienta las normales hacia abajo (N·ẑ <= 0)
    ///
    /// Convención habitual en mallas de terreno generadas desde DEM, donde las
    /// normales deben apuntar hacia el observador orbital. Solo se aplica a
    /// petición explícita del llamante
    pub fn flip_normals_down(&mut self) {
        for n in self.normals.iter_mut() {
            if n.z > 0.0 {
                *n = -*n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{point, vector};

    fn single_triangle() -> (Vec<Point3>, Vec<[u32; 3]>) {
        (
            vec![
                point![0.0, 0.0, 0.0],
                point![2.0, 0.0, 0.0],
                point![0.0, 1.0, 0.0],
            ],
            vec![[0, 1, 2]],
        )
    }

    #[test]
    fn derived_geometry() {
        let (vertices, faces) = single_triangle();
        let mesh = TriMesh::new(vertices, faces).unwrap();
        assert_eq!(mesh.num_faces(), 1);
        assert_eq!(mesh.num_verts(), 3);
        // centroide = media aritmética de los vértices
        let c = mesh.centroid(0);
        assert!((c - point![2.0 / 3.0, 1.0 / 3.0, 0.0]).norm() < 1e-6);
        // área = ‖(v1-v0)×(v2-v0)‖ / 2
        assert!((mesh.area(0) - 1.0).abs() < 1e-6);
        // normal unitaria según la regla de la mano derecha
        assert!((mesh.normal(0) - vector![0.0, 0.0, 1.0]).norm() < 1e-6);
    }

    #[test]
    fn rejects_degenerate_face() {
        let vertices = vec![
            point![0.0, 0.0, 0.0],
            point![1.0, 0.0, 0.0],
            point![2.0, 0.0, 0.0],
        ];
        let res = TriMesh::new(vertices, vec![[0, 1, 2]]);
        assert!(matches!(res, Err(FluxError::DegenerateMesh(_))));
    }

    #[test]
    fn rejects_out_of_range_index() {
        let (vertices, _) = single_triangle();
        let res = TriMesh::new(vertices, vec![[0, 1, 7]]);
        assert!(matches!(res, Err(FluxError::DegenerateMesh(_))));
    }

    #[test]
    fn rejects_non_unit_normals() {
        let (vertices, faces) = single_triangle();
        let res = TriMesh::with_normals(vertices, faces, vec![vector![0.0, 0.0, 2.0]]);
        assert!(matches!(res, Err(FluxError::DegenerateMesh(_))));
    }

    #[test]
    fn flip_normals() {
        let (vertices, faces) = single_triangle();
        let mut mesh = TriMesh::new(vertices, faces).unwrap();
        mesh.flip_normals_down();
        assert!((mesh.normal(0) - vector![0.0, 0.0, -1.0]).norm() < 1e-6);
        // la segunda aplicación es idempotente
        mesh.flip_normals_down();
        assert!(mesh.normal(0).z <= 0.0);
    }
}
