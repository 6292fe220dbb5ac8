// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

use criterion::{criterion_group, criterion_main, Criterion};
use nalgebra::DVector;

use fluxmodel::{point, CompressedFormFactor, FormFactorConfig, Point3, TriMesh};

/// Cráter paraboloide de prueba con ~1200 caras
fn crater_mesh() -> TriMesh {
    let (rings, segs) = (16_usize, 40_usize);
    let (r_outer, r_bowl, depth) = (30.0_f32, 20.0_f32, 10.0_f32);
    let z_of = |r: f32| {
        if r < r_bowl {
            -depth * (1.0 - (r / r_bowl).powi(2))
        } else {
            0.0
        }
    };
    let mut vertices: Vec<Point3> = vec![point![0.0, 0.0, z_of(0.0)]];
    for k in 1..=rings {
        let r = r_outer * k as f32 / rings as f32;
        for s in 0..segs {
            let theta = 2.0 * std::f32::consts::PI * s as f32 / segs as f32;
            vertices.push(point![r * theta.cos(), r * theta.sin(), z_of(r)]);
        }
    }
    let ring_start = |k: usize| 1 + (k - 1) * segs;
    let mut faces = Vec::new();
    for s in 0..segs {
        let a = (ring_start(1) + s) as u32;
        let b = (ring_start(1) + (s + 1) % segs) as u32;
        faces.push([0, a, b]);
    }
    for k in 1..rings {
        for s in 0..segs {
            let a = (ring_start(k) + s) as u32;
            let d = (ring_start(k) + (s + 1) % segs) as u32;
            let b = (ring_start(k + 1) + s) as u32;
            let c = (ring_start(k + 1) + (s + 1) % segs) as u32;
            faces.push([a, b, c]);
            faces.push([a, c, d]);
        }
    }
    TriMesh::new(vertices, faces).unwrap()
}

fn assembly_benchmark(c: &mut Criterion) {
    let mesh = crater_mesh();
    let config = FormFactorConfig {
        min_size: 128,
        ..Default::default()
    };

    c.bench_function("Ensambla operador de cráter", |b| {
        b.iter(|| CompressedFormFactor::assemble(&mesh, &config, None).unwrap())
    });

    let ff = CompressedFormFactor::assemble(&mesh, &config, None).unwrap();
    let x = DVector::from_element(ff.num_faces(), 1.0);
    c.bench_function("Aplica operador de cráter", |b| {
        b.iter(|| ff.apply(&x, None).unwrap())
    });
}

// Configuración del benchmarking
criterion_group! {
    name = benches;
    // https://docs.rs/criterion/0.3.4/criterion/struct.Criterion.html
    config = Criterion::default().sample_size(10);
    targets = assembly_benchmark
}

// Genera función main que ejecuta benchmarks en el grupo indicado
criterion_main!(benches);
