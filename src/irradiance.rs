// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Irradiancia solar directa sobre las caras de la malla, con test de sombra
//!
//! E[i] = F0 · max(0, N[i]·D̂) si el rayo desde P[i]+εN[i] hacia el sol
//! escapa al infinito, y 0 si queda ocluido. Con vectores sol no unitarios
//! (distancia real cara-sol en km) la constante solar se reescala con el
//! cuadrado de la distancia en unidades astronómicas.

use nalgebra::{DMatrix, DVector};

use crate::raytracing::RayTracer;
use crate::Vector3;

/// Unidad astronómica, km
pub const AU_KM: f32 = 149_597_900.0;

/// Irradiancia directa por cara para una dirección solar
///
/// `unit_svec` indica si `dir_sun` es un vector unitario (dirección del sol)
/// o el vector real cara-sol en km, en cuyo caso F0 se reescala por
/// (1 AU / ‖dir_sun‖)²
pub fn direct_irradiance(
    tracer: &RayTracer,
    f0: f32,
    dir_sun: &Vector3,
    unit_svec: bool,
) -> DVector<f32> {
    let mesh = tracer.mesh();
    let n = mesh.num_faces();
    let f0 = if unit_svec {
        f0
    } else {
        f0 * (AU_KM / dir_sun.norm()).powi(2)
    };
    let d_hat = dir_sun.normalize();

    let faces: Vec<u32> = (0..n as u32).collect();
    let occluded = tracer.occluded(&faces, &[d_hat]);

    DVector::from_fn(n, |i, _| {
        if occluded[i] {
            0.0
        } else {
            f0 * mesh.normal(i).dot(&d_hat).max(0.0)
        }
    })
}

/// Irradiancia directa para un lote de M direcciones solares (pasos de tiempo)
///
/// Devuelve una matriz N×M con una columna por dirección
pub fn direct_irradiance_batch(
    tracer: &RayTracer,
    f0: f32,
    dirs_sun: &[Vector3],
    unit_svec: bool,
) -> DMatrix<f32> {
    let n = tracer.mesh().num_faces();
    let mut result = DMatrix::zeros(n, dirs_sun.len());
    for (m, dir) in dirs_sun.iter().enumerate() {
        result.set_column(m, &direct_irradiance(tracer, f0, dir, unit_svec));
    }
    result
}

/// Vector orientado en la dirección del sol
///
/// sun_azimuth: azimuth solar [-180.0,+180.0] (E+, W-, S=0)
/// sun_altitude: altitud solar [0.0, +90] (90 es vertical)
pub fn ray_dir_to_sun(sun_azimuth: f32, sun_altitude: f32) -> Vector3 {
    let sazim = sun_azimuth.to_radians();
    let salt = sun_altitude.to_radians();
    crate::vector![
        salt.cos() * sazim.sin(),
        -salt.cos() * sazim.cos(),
        salt.sin()
    ]
    .normalize()
}
