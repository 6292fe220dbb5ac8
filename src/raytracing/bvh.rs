// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! BVH - Bounding Volume Hierarchy
//!
//! Partición de la geometría por objetos, usando AABBs (axis aligned bounding
//! boxes), para acelerar el cálculo de colisiones entre rayos y triángulos de
//! la malla. Cada elemento terminal conserva el índice de su cara, de modo que
//! las consultas pueden identificar la cara alcanzada más próxima.
//! https://gdbooks.gitbooks.io/3dcollisions/content/Chapter3/raycast_aabb.html

use std::ops::Deref;

use super::aabb::AABB;
use super::ray::Ray;
use crate::Point3;

/// Elementos capaces de definir la AABB que los encierra
pub trait Bounded {
    fn aabb(&self) -> AABB;
}

/// Elementos para los que se puede comprobar la intersección con un rayo
pub trait Intersectable {
    fn intersects(&self, ray: &Ray) -> Option<f32>;
}

impl<T: Bounded, U: Deref<Target = [T]>> Bounded for U {
    fn aabb(&self) -> AABB {
        self.iter()
            .fold(AABB::default(), |res, elem| res.join(elem.aabb()))
    }
}

/// Triángulo de la malla con su índice de cara
#[derive(Debug, Copy, Clone)]
pub struct Triangle {
    /// Índice de la cara en la malla
    pub id: u32,
    pub v0: Point3,
    pub v1: Point3,
    pub v2: Point3,
}

impl Bounded for Triangle {
    fn aabb(&self) -> AABB {
        let mut aabb = AABB::default();
        aabb.grow(self.v0);
        aabb.grow(self.v1);
        aabb.grow(self.v2);
        aabb
    }
}

impl Intersectable for Triangle {
    fn intersects(&self, ray: &Ray) -> Option<f32> {
        ray.intersects_triangle(self.v0, self.v1, self.v2)
    }
}

/// Nodos de la BVH. Puede ser un nodo terminal o intermedio
#[derive(Debug)]
pub enum BvhNode {
    Leaf {
        aabb: AABB,
        elements: Vec<Triangle>,
    },
    Node {
        aabb: AABB,
        left: Box<BvhNode>,
        right: Box<BvhNode>,
    },
}

impl Bounded for BvhNode {
    fn aabb(&self) -> AABB {
        match *self {
            BvhNode::Leaf { aabb, .. } => aabb,
            BvhNode::Node { aabb, .. } => aabb,
        }
    }
}

/// Bounding Volume Hierarchy (BVH) sobre los triángulos de la malla
#[derive(Debug)]
pub struct Bvh {
    pub root: Option<BvhNode>,
}

impl Bvh {
    /// Construye una BVH de forma recursiva a partir de un vector de triángulos
    ///
    /// Los nodos se subdividen por el plano que pasa por la media de los
    /// centroides en el eje más largo de su AABB, hasta que quedan
    /// max_num_elements o menos elementos por nodo terminal
    pub fn build(elements: Vec<Triangle>, max_num_elements: usize) -> Self {
        if elements.is_empty() {
            return Bvh { root: None };
        }
        Bvh {
            root: Some(Self::build_node(elements, max_num_elements)),
        }
    }

    fn build_node(elements: Vec<Triangle>, max_num_elements: usize) -> BvhNode {
        if elements.len() <= max_num_elements {
            let aabb = elements.aabb();
            return BvhNode::Leaf { aabb, elements };
        }
        let (left, right) = Self::partition_elements_by_centroid(elements);
        let left = Self::build_node(left, max_num_elements);
        let right = Self::build_node(right, max_num_elements);
        BvhNode::Node {
            aabb: left.aabb().join(right.aabb()),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Divide lista de elementos en dos partes usando el centroide en el eje más largo como plano divisor
    ///
    /// Si la división por la media no separa los elementos (todos los
    /// centroides coinciden) se reparte por la mitad de la lista
    fn partition_elements_by_centroid(elements: Vec<Triangle>) -> (Vec<Triangle>, Vec<Triangle>) {
        let aabb = elements.aabb();
        let dim = aabb.max.coords - aabb.min.coords;
        let len = elements.len() as f32;
        let axis = if dim.x >= dim.y && dim.x >= dim.z {
            0
        } else if dim.y >= dim.z {
            1
        } else {
            2
        };
        let mean = elements
            .iter()
            .map(|e| e.aabb().center().coords[axis])
            .sum::<f32>()
            / len;
        let (left, right): (Vec<_>, Vec<_>) = elements
            .into_iter()
            .partition(|e| e.aabb().center().coords[axis] < mean);
        if left.is_empty() || right.is_empty() {
            // reparto degenerado (centroides coincidentes): mitades de la lista
            let mut all = if left.is_empty() { right } else { left };
            let half = all.split_off(all.len() / 2);
            (all, half)
        } else {
            (left, right)
        }
    }

    /// Itera sobre los nodos con los que colisiona el rayo
    ///
    /// Devuelve tanto nodos intermedios (Node) como finales (Leaf) para los
    /// que hay colisión, bien con su AABB o sus elementos
    pub fn iter_with_ray(&self, ray: &Ray) -> PreorderIter {
        PreorderIter::new(self.root.as_ref(), *ray)
    }

    /// ¿Alcanza el rayo algún triángulo con id distinto de los excluidos y t < t_max?
    pub fn any_hit(&self, ray: &Ray, t_max: f32, skip: &[u32]) -> bool {
        for node in self
            .iter_with_ray(ray)
            .filter(|e| matches!(e, BvhNode::Leaf { .. }))
        {
            if let BvhNode::Leaf { elements, .. } = node {
                for tri in elements {
                    if skip.contains(&tri.id) {
                        continue;
                    }
                    if let Some(t) = tri.intersects(ray) {
                        if t < t_max {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Triángulo más próximo alcanzado por el rayo, con su parámetro t
    pub fn closest_hit(&self, ray: &Ray, skip: &[u32]) -> Option<(u32, f32)> {
        let mut best: Option<(u32, f32)> = None;
        for node in self
            .iter_with_ray(ray)
            .filter(|e| matches!(e, BvhNode::Leaf { .. }))
        {
            if let BvhNode::Leaf { elements, .. } = node {
                for tri in elements {
                    if skip.contains(&tri.id) {
                        continue;
                    }
                    if let Some(t) = tri.intersects(ray) {
                        if best.map_or(true, |(_, tb)| t < tb) {
                            best = Some((tri.id, t));
                        }
                    }
                }
            }
        }
        best
    }
}

// Implementación de iterador para recorrer el árbol (preorder traversal)
// Ver:
// - https://sachanganesh.com/programming/graph-tree-traversals-in-rust/
// - https://aloso.github.io/2021/03/09/creating-an-iterator
#[derive(Debug, Clone)]
pub struct PreorderIter<'a> {
    stack: Vec<&'a BvhNode>,
    ray: Ray,
}

impl<'a> PreorderIter<'a> {
    pub fn new(root: Option<&'a BvhNode>, ray: Ray) -> Self {
        if let Some(node) = root {
            PreorderIter {
                stack: vec![node],
                ray,
            }
        } else {
            PreorderIter { stack: vec![], ray }
        }
    }
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = &'a BvhNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            if node.aabb().intersects(&self.ray).is_some() {
                if let BvhNode::Node { right, left, .. } = node {
                    self.stack.push(right.deref());
                    self.stack.push(left.deref());
                };
                return Some(node);
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{point, vector};

    /// Cuatro triángulos horizontales separados en x
    fn test_triangles() -> Vec<Triangle> {
        (0..4)
            .map(|i| {
                let x = 2.0 * i as f32;
                Triangle {
                    id: i,
                    v0: point![x, 0.0, 0.0],
                    v1: point![x + 1.0, 0.0, 0.0],
                    v2: point![x, 1.0, 0.0],
                }
            })
            .collect()
    }

    /// Prueba la construcción de una BVH
    #[test]
    fn bvh_build_from_elements() {
        let bvh = Bvh::build(test_triangles(), 2);
        let root = bvh.root.as_ref().unwrap();
        let aabb = root.aabb();
        assert_eq!(aabb.min, point![0.0, 0.0, 0.0]);
        assert_eq!(aabb.max, point![7.0, 1.0, 0.0]);
        assert!(matches!(root, BvhNode::Node { .. }));
    }

    #[test]
    fn bvh_closest_hit() {
        let bvh = Bvh::build(test_triangles(), 2);
        // rayo vertical sobre el triángulo 1
        let ray = Ray::new(point![2.2, 0.2, 5.0], vector![0.0, 0.0, -1.0]);
        let (id, t) = bvh.closest_hit(&ray, &[]).unwrap();
        assert_eq!(id, 1);
        assert!((t - 5.0).abs() < 1e-5);
        // excluyendo el triángulo 1 no hay colisión
        assert!(bvh.closest_hit(&ray, &[1]).is_none());
    }

    #[test]
    fn bvh_any_hit_respects_t_max() {
        let bvh = Bvh::build(test_triangles(), 2);
        let ray = Ray::new(point![2.2, 0.2, 5.0], vector![0.0, 0.0, -1.0]);
        assert!(bvh.any_hit(&ray, f32::INFINITY, &[]));
        // la colisión queda más allá de t_max
        assert!(!bvh.any_hit(&ray, 4.0, &[]));
    }

    #[test]
    fn bvh_miss() {
        let bvh = Bvh::build(test_triangles(), 2);
        let ray = Ray::new(point![-5.0, 0.2, 5.0], vector![0.0, 0.0, -1.0]);
        assert!(bvh.closest_hit(&ray, &[]).is_none());
    }
}
