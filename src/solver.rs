// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Equilibrio radiativo estacionario por iteración de Neumann
//!
//! Balance de cuerpo gris con reflexión visible y autocalentamiento
//! infrarrojo:
//!
//!   (I - ρ·F)·B = E          radiosidad visible
//!   (I - F)·Q_ir = (1-ρ)·B   re-emisión infrarroja
//!   Q = (1-ε)·(1-ρ)·B + ε·Q_ir
//!   T = (Q / (ε·σ))^¼
//!
//! Cada sistema lineal se resuelve con el esquema de punto fijo
//! x_{k+1} = b + α·F·x_k, convergente mientras el radio espectral de α·F
//! quede bajo 1, lo que garantizan la no negatividad y la cota de suma de
//! fila de F para α <= 1.

use log::{debug, info};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::common::{CancelToken, FluxError};
use crate::formfactor::CompressedFormFactor;

/// Constante de Stefan-Boltzmann, W/m²K⁴
pub const SIGMA: f32 = 5.670_374_4e-8;

/// Parámetros térmicos del balance radiativo
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThermalParams {
    /// Albedo visible ρ [-]
    pub albedo: f32,
    /// Emisividad infrarroja ε [-]
    pub emissivity: f32,
    /// Tolerancia relativa de parada del solver
    pub tol: f32,
    /// Número máximo de aplicaciones del operador por sistema
    pub max_iters: u32,
}

impl Default for ThermalParams {
    fn default() -> Self {
        Self {
            albedo: 0.12,
            emissivity: 0.95,
            tol: 1e-6,
            max_iters: 1000,
        }
    }
}

/// Resultado del cálculo de equilibrio estacionario
#[derive(Debug, Clone)]
pub struct SteadyStateResult {
    /// Temperatura de equilibrio por cara, K
    pub temperature: DVector<f32>,
    /// Radiosidad visible B por cara, W/m²
    pub radiosity: DVector<f32>,
    /// Número total de aplicaciones del operador
    pub num_applies: u32,
}

/// Resuelve (I - α·F)·x = b por iteración de Neumann
///
/// Arranca en x₀ = b e itera x_{k+1} = b + α·F·x_k hasta que el paso
/// ‖x_{k+1}-x_k‖ baja de la tolerancia (relativa a ‖b‖) o el decremento del
/// residuo se estanca. Devuelve la solución y el número de aplicaciones
pub fn solve_kernel_system(
    ff: &CompressedFormFactor,
    b: &DVector<f32>,
    alpha: f32,
    tol: f32,
    max_iters: u32,
    cancel: Option<&CancelToken>,
) -> Result<(DVector<f32>, u32), FluxError> {
    let tol_abs = tol * b.norm().max(f32::MIN_POSITIVE);
    let mut x = b.clone();
    let mut applies = 0_u32;
    let mut initial_step: Option<f32> = None;
    let mut prev_step: Option<f32> = None;

    loop {
        let y = ff.apply(&x, cancel)?;
        applies += 1;
        let x_next = b + alpha * y;
        let step = (&x_next - &x).norm();
        initial_step.get_or_insert(step);

        if step < tol_abs {
            return Ok((x_next, applies));
        }
        if let Some(prev) = prev_step {
            // el decremento del residuo se ha estancado: aceptamos la solución
            if (prev - step).abs() < 0.1 * tol_abs {
                debug!("solver estancado tras {} aplicaciones (paso {})", applies, step);
                return Ok((x_next, applies));
            }
        }
        if applies >= max_iters {
            let initial = initial_step.unwrap_or(step);
            if step > tol * initial.max(f32::MIN_POSITIVE) {
                return Err(FluxError::NumericalBreakdown {
                    iters: applies,
                    residual: step,
                });
            }
            return Ok((x_next, applies));
        }
        prev_step = Some(step);
        x = x_next;
    }
}

/// Temperatura de equilibrio estacionario bajo la irradiancia directa E
///
/// Resuelve la radiosidad visible con albedo ρ, el autocalentamiento
/// infrarrojo con α = 1, y convierte el flujo absorbido y re-emitido en
/// temperatura con la ley de Stefan-Boltzmann
pub fn steady_state_temperature(
    ff: &CompressedFormFactor,
    e: &DVector<f32>,
    params: &ThermalParams,
    cancel: Option<&CancelToken>,
) -> Result<SteadyStateResult, FluxError> {
    let ThermalParams {
        albedo,
        emissivity,
        tol,
        max_iters,
    } = *params;

    // radiosidad visible: (I - ρ·F)·B = E
    let (radiosity, n_vis) = solve_kernel_system(ff, e, albedo, tol, max_iters, cancel)?;
    // flujo visible absorbido
    let q_vis = (1.0 - albedo) * &radiosity;
    // re-emisión infrarroja: (I - F)·Q_ir = Q_vis
    let (q_ir, n_ir) = solve_kernel_system(ff, &q_vis, 1.0, tol, max_iters, cancel)?;

    let temperature = DVector::from_fn(e.len(), |i, _| {
        let q = (1.0 - emissivity) * q_vis[i] + emissivity * q_ir[i];
        (q.max(0.0) / (emissivity * SIGMA)).powf(0.25)
    });

    let num_applies = n_vis + n_ir;
    info!(
        "equilibrio estacionario resuelto con {} aplicaciones del operador",
        num_applies
    );

    Ok(SteadyStateResult {
        temperature,
        radiosity,
        num_applies,
    })
}
