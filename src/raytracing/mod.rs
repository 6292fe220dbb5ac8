// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Trazado de rayos sobre la malla: oráculo de oclusión y visibilidad
//!
//! El oráculo responde dos consultas primitivas sobre la malla:
//! - `occluded`: ¿el rayo lanzado desde una cara alcanza algún triángulo?
//! - `visible`: ¿el segmento abierto entre dos centroides está despejado?
//!
//! Hay dos implementaciones intercambiables (BVH en f32 y árbol AABB en f64)
//! que deben devolver los mismos booleanos módulo la perturbación ε.

mod aabb;
mod bvh;
mod oracle;
mod ray;

pub use aabb::AABB;
pub use bvh::{Bounded, Bvh, Intersectable, Triangle};
pub use oracle::{AabbTree, RayTracer};
pub use ray::Ray;
