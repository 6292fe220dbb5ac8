// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Cálculo de temperaturas de equilibrio radiativo sobre mallas trianguladas
//!
//! Modelo de intercambio radiativo entre elementos de una malla de triángulos
//! (terrenos planetarios, cráteres en sombra permanente) usando una matriz de
//! factores de forma comprimida por bloques jerárquicos:
//!
//! - geometría derivada de la malla (centroides, normales, áreas)
//! - oráculo de visibilidad por trazado de rayos (BVH o árbol AABB)
//! - partición espacial de caras (quadtree / octree)
//! - compresión por bloques de rango bajo (SVD truncada / ACA)
//! - irradiancia solar directa con test de sombra
//! - solver de equilibrio estacionario por iteración de Neumann

pub mod common;
pub mod formfactor;
pub mod geometry;
pub mod irradiance;
pub mod raytracing;
pub mod solver;

pub use common::{
    CancelToken, EpsSelf, FluxError, FormFactorConfig, OracleKind, TreeKind, Warning,
    WarningLevel,
};
pub use formfactor::{full_form_factor_matrix, AssemblyStats, CompressedFormFactor};
pub use geometry::TriMesh;
pub use irradiance::{direct_irradiance, direct_irradiance_batch, ray_dir_to_sun};
pub use solver::{steady_state_temperature, SteadyStateResult, ThermalParams, SIGMA};

// Reexportamos los tipos y macros de nalgebra que usa toda la API
pub use nalgebra::{point, vector};

/// Puntos 3D en simple precisión
pub type Point3 = nalgebra::Point3<f32>;
/// Vectores 3D en simple precisión
pub type Vector3 = nalgebra::Vector3<f32>;

/// Versión del programa
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
