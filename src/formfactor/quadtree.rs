// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Partición espacial de caras por subdivisión de centroides (quadtree/octree)
//!
//! Cada nodo divide su caja alineada por el punto medio de los ejes activos
//! (xy para quadtree, xyz para octree) y recurre hasta quedarse con min_size
//! caras o menos, o hasta que la subdivisión no separa los centroides. Los
//! hijos vacíos se omiten (lista dispersa de hijos).
//!
//! El mismo árbol define la partición de filas y la de columnas del operador,
//! que es cuadrado y endofuncional sobre las caras.

use crate::common::TreeKind;
use crate::Point3;

/// Nodo del árbol de caras
///
/// Las caras de un nodo intermedio son la concatenación de las de sus hijos,
/// en orden de octante, de modo que el conjunto de índices de cada hijo es un
/// tramo contiguo del conjunto del padre
#[derive(Debug, Clone)]
pub struct FaceNode {
    /// Índices de cara del nodo
    pub faces: Vec<u32>,
    /// Hijos no vacíos, en orden de octante
    pub children: Vec<FaceNode>,
}

impl FaceNode {
    /// ¿Es un nodo terminal?
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Profundidad del subárbol (1 para un nodo terminal)
    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(FaceNode::depth)
            .max()
            .unwrap_or(0)
    }
}

/// Construye el árbol de partición sobre los centroides de todas las caras
pub fn build_face_tree(centroids: &[Point3], kind: TreeKind, min_size: usize) -> FaceNode {
    let faces: Vec<u32> = (0..centroids.len() as u32).collect();
    build_node(faces, centroids, kind, min_size.max(1))
}

fn build_node(faces: Vec<u32>, centroids: &[Point3], kind: TreeKind, min_size: usize) -> FaceNode {
    if faces.len() <= min_size {
        return FaceNode {
            faces,
            children: Vec::new(),
        };
    }

    let naxes = match kind {
        TreeKind::Quadtree => 2,
        TreeKind::Octree => 3,
    };

    // caja alineada de los centroides propios y punto medio por eje activo
    let mut lo = [f32::INFINITY; 3];
    let mut hi = [f32::NEG_INFINITY; 3];
    for &f in &faces {
        let c = centroids[f as usize];
        for (axis, value) in [c.x, c.y, c.z].iter().enumerate().take(naxes) {
            lo[axis] = lo[axis].min(*value);
            hi[axis] = hi[axis].max(*value);
        }
    }
    let mid: Vec<f32> = (0..naxes).map(|a| 0.5 * (lo[a] + hi[a])).collect();

    // reparto por octante. Un centroide exactamente sobre un plano divisor
    // va al hijo de coordenada inferior
    let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); 1 << naxes];
    for &f in &faces {
        let c = centroids[f as usize];
        let coords = [c.x, c.y, c.z];
        let mut octant = 0_usize;
        for (axis, &m) in mid.iter().enumerate() {
            if coords[axis] > m {
                octant |= 1 << axis;
            }
        }
        buckets[octant].push(f);
    }

    // si la subdivisión no separa nada, el nodo pasa a terminal
    if buckets.iter().filter(|b| !b.is_empty()).count() < 2 {
        return FaceNode {
            faces,
            children: Vec::new(),
        };
    }

    let children: Vec<FaceNode> = buckets
        .into_iter()
        .filter(|b| !b.is_empty())
        .map(|b| build_node(b, centroids, kind, min_size))
        .collect();

    // las caras del padre quedan en el orden de concatenación de los hijos
    let faces = children
        .iter()
        .flat_map(|c| c.faces.iter().copied())
        .collect();

    FaceNode { faces, children }
}
