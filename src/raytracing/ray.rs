// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Módulo que define una estructura de rayo (origen + dirección)

use crate::{Point3, Vector3};

const EPSILON: f32 = 1e-7;

/// Estructura que define un rayo, con su origen y dirección
#[derive(Debug, Copy, Clone)]
pub struct Ray {
    /// Origen del rayo.
    pub origin: Point3,
    /// Dirección del rayo.
    pub dir: Vector3,
}

impl Ray {
    /// Crea un nuevo rayo [`Ray`] a partir de un origen y una dirección.
    /// La dirección es normalizada.
    ///
    /// # Ejemplos
    /// ```
    /// use nalgebra::{point, vector};
    /// use fluxmodel::raytracing::Ray;
    ///
    /// let origin = point![0.0, 0.0, 0.0];
    /// let dir = vector![1.0, 0.0, 0.0];
    /// let ray = Ray::new(origin, dir);
    ///
    /// assert_eq!(ray.origin, origin);
    /// assert_eq!(ray.dir, dir);
    /// ```
    ///
    /// [`Ray`]: struct.Ray.html
    ///
    pub fn new(origin: Point3, dir: Vector3) -> Ray {
        let dir = dir.normalize();
        Ray { origin, dir }
    }

    /// Calcula la intersección entre el rayo y un triángulo (Möller-Trumbore)
    ///
    /// Devuelve t tal que la intersección se produce en origin + t * dir,
    /// solo para t > 0 (¡es un rayo!). Los rayos paralelos al plano del
    /// triángulo no intersecan
    ///
    /// https://www.scratchapixel.com/lessons/3d-basic-rendering/ray-tracing-rendering-a-triangle/moller-trumbore-ray-triangle-intersection
    pub fn intersects_triangle(&self, v0: Point3, v1: Point3, v2: Point3) -> Option<f32> {
        let edge1 = v1 - v0;
        let edge2 = v2 - v0;
        let pvec = self.dir.cross(&edge2);
        let det = edge1.dot(&pvec);

        // Rayo paralelo al plano del triángulo (test de doble cara)
        if det.abs() < EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;

        let tvec = self.origin - v0;
        let u = tvec.dot(&pvec) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let qvec = tvec.cross(&edge1);
        let v = self.dir.dot(&qvec) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = edge2.dot(&qvec) * inv_det;
        if t > EPSILON {
            Some(t)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{point, vector};

    #[test]
    fn triangle_hit() {
        let ray = Ray::new(point![0.25, 0.25, 1.0], vector![0.0, 0.0, -1.0]);
        let t = ray.intersects_triangle(
            point![0.0, 0.0, 0.0],
            point![1.0, 0.0, 0.0],
            point![0.0, 1.0, 0.0],
        );
        assert!((t.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn triangle_miss() {
        let ray = Ray::new(point![2.0, 2.0, 1.0], vector![0.0, 0.0, -1.0]);
        assert!(ray
            .intersects_triangle(
                point![0.0, 0.0, 0.0],
                point![1.0, 0.0, 0.0],
                point![0.0, 1.0, 0.0],
            )
            .is_none());
    }

    #[test]
    fn triangle_behind_ray() {
        let ray = Ray::new(point![0.25, 0.25, 1.0], vector![0.0, 0.0, 1.0]);
        assert!(ray
            .intersects_triangle(
                point![0.0, 0.0, 0.0],
                point![1.0, 0.0, 0.0],
                point![0.0, 1.0, 0.0],
            )
            .is_none());
    }

    #[test]
    fn triangle_parallel_ray() {
        let ray = Ray::new(point![0.0, 0.0, 1.0], vector![1.0, 0.0, 0.0]);
        assert!(ray
            .intersects_triangle(
                point![0.0, 0.0, 0.0],
                point![1.0, 0.0, 0.0],
                point![0.0, 1.0, 0.0],
            )
            .is_none());
    }

    #[test]
    fn backface_hit() {
        // la intersección es de doble cara: también alcanza la cara trasera
        let ray = Ray::new(point![0.25, 0.25, -1.0], vector![0.0, 0.0, 1.0]);
        let t = ray.intersects_triangle(
            point![0.0, 0.0, 0.0],
            point![1.0, 0.0, 0.0],
            point![0.0, 1.0, 0.0],
        );
        assert!((t.unwrap() - 1.0).abs() < 1e-6);
    }
}
