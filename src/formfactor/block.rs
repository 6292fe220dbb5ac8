// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Ensamblado explícito de bloques densos de la matriz de factores de forma
//!
//! La entrada (p, q) de un bloque con filas I y columnas J es el factor de
//! forma punto a punto entre los centroides de las caras i = I[p] y j = J[q]:
//!
//!   B[p,q] = vis(i,j) · max(0, N_i·d̂) · max(0, -N_j·d̂) · A_j / (π·r²)
//!
//! con d = P[j] - P[i] y r = ‖d‖. La diagonal es nula y las entradas con
//! coseno no positivo se anulan antes del test de visibilidad, que es la
//! consulta cara.

use std::f32::consts::PI;

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::common::{FluxError, FormFactorConfig};
use crate::geometry::TriMesh;
use crate::raytracing::RayTracer;

/// Factor de forma punto a punto entre las caras i y j
///
/// Anula primero los términos geométricos (diagonal y cosenos) y solo
/// entonces consulta la visibilidad al oráculo
pub fn form_factor_entry(mesh: &TriMesh, tracer: &RayTracer, i: u32, j: u32) -> f32 {
    if i == j {
        return 0.0;
    }
    let (iu, ju) = (i as usize, j as usize);
    let d = mesh.centroid(ju) - mesh.centroid(iu);
    let r_sq = d.norm_squared();
    if r_sq <= 0.0 {
        return 0.0;
    }
    let d_hat = d / r_sq.sqrt();
    let cos_i = mesh.normal(iu).dot(&d_hat);
    if cos_i <= 0.0 {
        return 0.0;
    }
    let cos_j = -mesh.normal(ju).dot(&d_hat);
    if cos_j <= 0.0 {
        return 0.0;
    }
    if !tracer.visible(i, j) {
        return 0.0;
    }
    cos_i * cos_j * mesh.area(ju) / (PI * r_sq)
}

/// Ensambla el bloque denso |I|×|J| de factores de forma
pub fn assemble_block(
    mesh: &TriMesh,
    tracer: &RayTracer,
    rows: &[u32],
    cols: &[u32],
    parallel: bool,
) -> DMatrix<f32> {
    let data: Vec<f32> = if parallel {
        rows.par_iter()
            .flat_map_iter(|&i| cols.iter().map(move |&j| (i, j)))
            .map(|(i, j)| form_factor_entry(mesh, tracer, i, j))
            .collect()
    } else {
        rows.iter()
            .flat_map(|&i| cols.iter().map(move |&j| (i, j)))
            .map(|(i, j)| form_factor_entry(mesh, tracer, i, j))
            .collect()
    };
    DMatrix::from_row_slice(rows.len(), cols.len(), &data)
}

/// Fila p del bloque (I, J), para el muestreo de la aproximación cruzada
pub fn assemble_row(
    mesh: &TriMesh,
    tracer: &RayTracer,
    rows: &[u32],
    cols: &[u32],
    p: usize,
) -> nalgebra::DVector<f32> {
    let i = rows[p];
    nalgebra::DVector::from_iterator(
        cols.len(),
        cols.iter().map(|&j| form_factor_entry(mesh, tracer, i, j)),
    )
}

/// Columna q del bloque (I, J), para el muestreo de la aproximación cruzada
pub fn assemble_col(
    mesh: &TriMesh,
    tracer: &RayTracer,
    rows: &[u32],
    cols: &[u32],
    q: usize,
) -> nalgebra::DVector<f32> {
    let j = cols[q];
    nalgebra::DVector::from_iterator(
        rows.len(),
        rows.iter().map(|&i| form_factor_entry(mesh, tracer, i, j)),
    )
}

/// Matriz completa N×N de factores de forma, sin comprimir
///
/// Referencia exacta para mallas pequeñas (tests de equivalencia y
/// diagnóstico). Para mallas realistas su coste O(N²) es prohibitivo
pub fn full_form_factor_matrix(
    mesh: &TriMesh,
    config: &FormFactorConfig,
) -> Result<DMatrix<f32>, FluxError> {
    let tracer = RayTracer::build(mesh, config)?;
    let all: Vec<u32> = (0..mesh.num_faces() as u32).collect();
    Ok(assemble_block(mesh, &tracer, &all, &all, config.parallel))
}
