// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Operador de factores de forma comprimido por bloques jerárquicos
//!
//! El operador F (N×N, F[i,j] = fracción de la radiación que sale de la cara
//! i y llega directamente a la cara j) no se materializa nunca: se representa
//! como un árbol de bloques que refleja la partición espacial de las caras.
//! Los pares de nodos terminales producen hojas comprimidas (densas,
//! dispersas, de rango bajo o nulas) y los pares intermedios producen bloques
//! con el producto cartesiano de los hijos.
//!
//! Los nodos viven en una arena plana con índices (sin grafo de punteros), lo
//! que da un recorrido amigable con la caché y una serialización trivial.
//!
//! Orden de recorrido (determinista, documentado por reproducibilidad): los
//! hijos de un bloque intermedio se visitan en orden «row-major», recorriendo
//! los hijos de columna dentro de cada hijo de fila, con los nodos espaciales
//! en orden de octante. El ensamblado en paralelo no altera este orden.

use log::{debug, info};
use nalgebra::DVector;
use rayon::prelude::*;
use serde::Serialize;

use super::block::{assemble_block, assemble_col, assemble_row};
use super::lowrank::{aca_approximation, compress_block, sparse_or_dense, LeafData};
use super::quadtree::{build_face_tree, FaceNode};
use crate::common::{CancelToken, FluxError, FormFactorConfig, Warning, WarningLevel};
use crate::geometry::TriMesh;
use crate::raytracing::RayTracer;

/// Número de entradas de bloque a partir del cual se intenta la aproximación
/// cruzada sin ensamblar el bloque explícito
const ACA_MIN_ENTRIES: usize = 1 << 20;

/// Bytes de sobrecoste estructural estimados por nodo del árbol
const NODE_OVERHEAD: usize = 32;

/// Bloque del operador en la arena de nodos
#[derive(Debug, Clone)]
pub enum Block {
    /// Bloque intermedio con hijos en orden row-major
    Internal {
        rows: Vec<u32>,
        cols: Vec<u32>,
        children: Vec<ChildRef>,
    },
    /// Bloque terminal con su payload comprimido
    Leaf {
        rows: Vec<u32>,
        cols: Vec<u32>,
        data: LeafData,
    },
}

impl Block {
    pub fn rows(&self) -> &[u32] {
        match self {
            Block::Internal { rows, .. } => rows,
            Block::Leaf { rows, .. } => rows,
        }
    }

    pub fn cols(&self) -> &[u32] {
        match self {
            Block::Internal { cols, .. } => cols,
            Block::Leaf { cols, .. } => cols,
        }
    }
}

/// Referencia a un bloque hijo con los desplazamientos de sus índices
/// dentro de los conjuntos de fila y columna del padre
#[derive(Debug, Clone, Copy)]
pub struct ChildRef {
    /// Índice del nodo hijo en la arena
    pub node: usize,
    /// Desplazamiento del tramo de filas del hijo en las filas del padre
    pub row_off: usize,
    /// Desplazamiento del tramo de columnas del hijo en las columnas del padre
    pub col_off: usize,
}

/// Estadísticas y diagnósticos del ensamblado
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssemblyStats {
    /// Bloques intermedios
    pub num_internal: usize,
    /// Hojas densas
    pub num_dense: usize,
    /// Hojas dispersas
    pub num_sparse: usize,
    /// Hojas de rango bajo
    pub num_lowrank: usize,
    /// Hojas nulas
    pub num_zero: usize,
    /// Profundidad del árbol de bloques
    pub depth: usize,
    /// Huella de memoria en bytes (payloads + estructura)
    pub nbytes: usize,
    /// Hojas fuera de la diagonal en las que se rechazó la compresión de rango bajo
    pub compression_rejections: usize,
    /// Avisos no fatales acumulados durante el ensamblado
    pub warnings: Vec<Warning>,
}

impl AssemblyStats {
    /// Devuelve resultados en formato JSON
    pub fn as_json(&self) -> Result<String, anyhow::Error> {
        let json = serde_json::to_string_pretty(&self)?;
        Ok(json)
    }
}

/// Operador de factores de forma comprimido
///
/// Tras el ensamblado es de solo lectura: la aplicación `y = F·x` solo
/// necesita los datos de bloque. La identidad de la malla queda fijada al
/// construirlo y un remallado invalida el operador
#[derive(Debug, Clone)]
pub struct CompressedFormFactor {
    num_faces: usize,
    tol: f64,
    min_size: u32,
    arity: u8,
    parallel: bool,
    /// Arena de nodos en preorden; la raíz es el nodo 0
    nodes: Vec<Block>,
    stats: AssemblyStats,
}

/// Bloque intermedio del ensamblado, previo al aplanado en arena
enum RawBlock {
    Internal {
        rows: Vec<u32>,
        cols: Vec<u32>,
        children: Vec<RawBlock>,
    },
    Leaf {
        rows: Vec<u32>,
        cols: Vec<u32>,
        data: LeafData,
    },
}

impl CompressedFormFactor {
    /// Ensambla el operador comprimido sobre la malla
    ///
    /// El oráculo de rayos es estado interno de construcción y se descarta al
    /// terminar. La cancelación se comprueba en las fronteras de bloque
    pub fn assemble(
        mesh: &TriMesh,
        config: &FormFactorConfig,
        cancel: Option<&CancelToken>,
    ) -> Result<Self, FluxError> {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        let tracer = RayTracer::build(mesh, config)?;
        let tree = build_face_tree(mesh.centroids(), config.tree, config.min_size as usize);

        let ctx = AssemblyCtx {
            mesh,
            tracer: &tracer,
            config,
            cancel,
        };
        let raw = assemble_pair(&ctx, &tree, &tree)?;

        let mut nodes = Vec::new();
        flatten(raw, &mut nodes)?;

        let mut ff = Self {
            num_faces: mesh.num_faces(),
            tol: config.tol,
            min_size: config.min_size,
            arity: config.tree.arity(),
            parallel: config.parallel,
            nodes,
            stats: AssemblyStats::default(),
        };
        ff.stats = ff.compute_stats();
        ff.collect_warnings(cancel)?;

        info!(
            "operador ensamblado: N={}, nodos={}, profundidad={}, {:.2} MB (densas {}, dispersas {}, rango bajo {}, nulas {})",
            ff.num_faces,
            ff.nodes.len(),
            ff.stats.depth,
            ff.stats.nbytes as f64 / (1024.0 * 1024.0),
            ff.stats.num_dense,
            ff.stats.num_sparse,
            ff.stats.num_lowrank,
            ff.stats.num_zero,
        );
        Ok(ff)
    }

    /// Reconstruye el operador desde la arena de nodos (deserialización)
    pub(crate) fn from_parts(
        num_faces: usize,
        tol: f64,
        min_size: u32,
        arity: u8,
        nodes: Vec<Block>,
    ) -> Self {
        let mut ff = Self {
            num_faces,
            tol,
            min_size,
            arity,
            parallel: true,
            nodes,
            stats: AssemblyStats::default(),
        };
        ff.stats = ff.compute_stats();
        ff
    }

    /// Número de caras (filas y columnas del operador)
    pub fn num_faces(&self) -> usize {
        self.num_faces
    }

    /// Tolerancia relativa de compresión usada en el ensamblado
    pub fn tol(&self) -> f64 {
        self.tol
    }

    /// Tamaño mínimo de bloque usado en el ensamblado
    pub fn min_size(&self) -> u32 {
        self.min_size
    }

    /// Aridad del árbol espacial (4 quadtree, 8 octree)
    pub fn arity(&self) -> u8 {
        self.arity
    }

    pub(crate) fn nodes(&self) -> &[Block] {
        &self.nodes
    }

    /// Estadísticas y avisos del ensamblado
    pub fn stats(&self) -> &AssemblyStats {
        &self.stats
    }

    /// Huella total en bytes: payloads de las hojas más estructura del árbol
    pub fn nbytes(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| {
                let payload = match node {
                    Block::Leaf { data, .. } => data.nbytes(),
                    Block::Internal { .. } => 0,
                };
                payload + 4 * (node.rows().len() + node.cols().len()) + NODE_OVERHEAD
            })
            .sum()
    }

    /// Profundidad del árbol de bloques
    pub fn depth(&self) -> usize {
        fn depth_of(nodes: &[Block], id: usize) -> usize {
            match &nodes[id] {
                Block::Leaf { .. } => 1,
                Block::Internal { children, .. } => {
                    1 + children
                        .iter()
                        .map(|c| depth_of(nodes, c.node))
                        .max()
                        .unwrap_or(0)
                }
            }
        }
        depth_of(&self.nodes, 0)
    }

    /// Aplica el operador, y = F·x
    ///
    /// Es una función pura que solo puede fallar por cancelación (o por un
    /// vector de entrada de dimensión incorrecta, que es un error de uso).
    /// Paralela entre bloques hermanos: las particiones de fila de los hijos
    /// son disjuntas y no se necesita sincronización sobre la salida
    pub fn apply(
        &self,
        x: &DVector<f32>,
        cancel: Option<&CancelToken>,
    ) -> Result<DVector<f32>, FluxError> {
        if x.len() != self.num_faces {
            return Err(FluxError::InvariantViolated(format!(
                "dimensión de x ({}) distinta del número de caras ({})",
                x.len(),
                self.num_faces
            )));
        }
        let root = &self.nodes[0];
        // recolocamos x en el orden de columnas de la raíz y deshacemos la
        // permutación de filas al terminar
        let x_root: Vec<f32> = root.cols().iter().map(|&j| x[j as usize]).collect();
        let mut y_root = vec![0.0_f32; root.rows().len()];
        self.apply_node(0, &x_root, &mut y_root, cancel)?;
        let mut y = DVector::zeros(self.num_faces);
        for (&i, &v) in root.rows().iter().zip(y_root.iter()) {
            y[i as usize] = v;
        }
        Ok(y)
    }

    fn apply_node(
        &self,
        id: usize,
        x: &[f32],
        y: &mut [f32],
        cancel: Option<&CancelToken>,
    ) -> Result<(), FluxError> {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        match &self.nodes[id] {
            Block::Leaf { data, .. } => {
                data.mul_add(x, y);
                Ok(())
            }
            Block::Internal { children, .. } => {
                // agrupamos los hijos por tramo de filas: los grupos escriben
                // en tramos disjuntos de y, y son paralelizables sin bloqueo
                let mut groups: Vec<(usize, usize, Vec<ChildRef>)> = Vec::new();
                for child in children {
                    let rlen = self.nodes[child.node].rows().len();
                    match groups.last_mut() {
                        Some((off, _, group)) if *off == child.row_off => group.push(*child),
                        _ => groups.push((child.row_off, rlen, vec![*child])),
                    }
                }
                if self.parallel && groups.len() > 1 {
                    let partials: Vec<Result<Vec<f32>, FluxError>> = groups
                        .par_iter()
                        .map(|(_, rlen, group)| {
                            let mut y_local = vec![0.0_f32; *rlen];
                            for child in group {
                                let clen = self.nodes[child.node].cols().len();
                                self.apply_node(
                                    child.node,
                                    &x[child.col_off..child.col_off + clen],
                                    &mut y_local,
                                    cancel,
                                )?;
                            }
                            Ok(y_local)
                        })
                        .collect();
                    for ((off, _, _), partial) in groups.iter().zip(partials) {
                        let partial = partial?;
                        for (k, v) in partial.into_iter().enumerate() {
                            y[off + k] += v;
                        }
                    }
                } else {
                    for child in children {
                        let rlen = self.nodes[child.node].rows().len();
                        let clen = self.nodes[child.node].cols().len();
                        self.apply_node(
                            child.node,
                            &x[child.col_off..child.col_off + clen],
                            &mut y[child.row_off..child.row_off + rlen],
                            cancel,
                        )?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Sumas de fila del operador, F·1
    pub fn row_sums(&self) -> DVector<f32> {
        let ones = DVector::from_element(self.num_faces, 1.0);
        // sin señal de cancelación la aplicación no puede fallar
        match self.apply(&ones, None) {
            Ok(sums) => sums,
            Err(_) => DVector::zeros(self.num_faces),
        }
    }

    fn compute_stats(&self) -> AssemblyStats {
        let mut stats = AssemblyStats {
            depth: self.depth(),
            nbytes: self.nbytes(),
            ..Default::default()
        };
        for node in &self.nodes {
            match node {
                Block::Internal { .. } => stats.num_internal += 1,
                Block::Leaf { data, .. } => match data {
                    LeafData::Dense(_) => stats.num_dense += 1,
                    LeafData::Sparse(_) => stats.num_sparse += 1,
                    LeafData::LowRank { .. } => stats.num_lowrank += 1,
                    LeafData::Zero => stats.num_zero += 1,
                },
            }
        }
        stats
    }

    /// Acumula avisos no fatales: excesos de suma de fila y tasa de rechazo
    /// de la compresión de rango bajo
    fn collect_warnings(&mut self, cancel: Option<&CancelToken>) -> Result<(), FluxError> {
        let ones = DVector::from_element(self.num_faces, 1.0);
        let sums = self.apply(&ones, cancel)?;
        // δ <= 10·τ por la aproximación punto a punto entre centroides
        let delta = 10.0 * self.tol as f32;
        let overshoot = sums.iter().filter(|&&s| s > 1.0 + delta).count();
        if overshoot > 0 {
            let max_sum = sums.iter().cloned().fold(0.0_f32, f32::max);
            self.stats.warnings.push(Warning {
                level: WarningLevel::WARNING,
                id: None,
                msg: format!(
                    "{} filas con suma > 1+{} (máximo {:.4}); geometría casi plana o malla gruesa",
                    overshoot, delta, max_sum
                ),
            });
        }

        // rechazos de compresión fuera de la diagonal
        let mut offdiag_leaves = 0_usize;
        let mut rejections = 0_usize;
        for node in &self.nodes {
            if let Block::Leaf { rows, cols, data } = node {
                if rows == cols {
                    continue;
                }
                offdiag_leaves += 1;
                if matches!(data, LeafData::Dense(_) | LeafData::Sparse(_)) {
                    rejections += 1;
                }
            }
        }
        self.stats.compression_rejections = rejections;
        if offdiag_leaves > 0 && rejections * 2 > offdiag_leaves {
            self.stats.warnings.push(Warning {
                level: WarningLevel::INFO,
                id: None,
                msg: format!(
                    "compresión de rango bajo rechazada en {}/{} hojas fuera de la diagonal",
                    rejections, offdiag_leaves
                ),
            });
        }
        Ok(())
    }
}

struct AssemblyCtx<'a> {
    mesh: &'a TriMesh,
    tracer: &'a RayTracer<'a>,
    config: &'a FormFactorConfig,
    cancel: Option<&'a CancelToken>,
}

/// Desciende en paralelo por los árboles de filas y columnas
fn assemble_pair(
    ctx: &AssemblyCtx,
    row_node: &FaceNode,
    col_node: &FaceNode,
) -> Result<RawBlock, FluxError> {
    if let Some(cancel) = ctx.cancel {
        cancel.check()?;
    }

    if row_node.is_leaf() && col_node.is_leaf() {
        return assemble_leaf(ctx, row_node, col_node);
    }

    // un nodo terminal emparejado con uno intermedio actúa como su único hijo
    let row_children: &[FaceNode] = if row_node.is_leaf() {
        std::slice::from_ref(row_node)
    } else {
        &row_node.children
    };
    let col_children: &[FaceNode] = if col_node.is_leaf() {
        std::slice::from_ref(col_node)
    } else {
        &col_node.children
    };

    let pairs: Vec<(&FaceNode, &FaceNode)> = row_children
        .iter()
        .flat_map(|r| col_children.iter().map(move |c| (r, c)))
        .collect();

    let children: Result<Vec<RawBlock>, FluxError> = if ctx.config.parallel {
        pairs
            .par_iter()
            .map(|(r, c)| assemble_pair(ctx, r, c))
            .collect()
    } else {
        pairs
            .iter()
            .map(|(r, c)| assemble_pair(ctx, r, c))
            .collect()
    };

    Ok(RawBlock::Internal {
        rows: row_node.faces.clone(),
        cols: col_node.faces.clone(),
        children: children?,
    })
}

/// Emite una hoja comprimida para un par de nodos terminales
fn assemble_leaf(
    ctx: &AssemblyCtx,
    row_node: &FaceNode,
    col_node: &FaceNode,
) -> Result<RawBlock, FluxError> {
    let rows = row_node.faces.clone();
    let cols = col_node.faces.clone();
    let diagonal = std::ptr::eq(row_node, col_node);

    let tol = ctx.config.tol as f32;
    let data = if diagonal {
        // en los bloques diagonales domina la contribución de autovisión:
        // siempre densos o dispersos
        let block = assemble_block(ctx.mesh, ctx.tracer, &rows, &cols, false);
        sparse_or_dense(block)
    } else if rows.len() * cols.len() >= ACA_MIN_ENTRIES {
        // bloque grande: intentamos la aproximación cruzada sin ensamblarlo
        let row_of = |p: usize| assemble_row(ctx.mesh, ctx.tracer, &rows, &cols, p);
        let col_of = |q: usize| assemble_col(ctx.mesh, ctx.tracer, &rows, &cols, q);
        let aca = aca_approximation(
            rows.len(),
            cols.len(),
            &row_of,
            &col_of,
            tol,
            ctx.config.max_rank,
        )
        .filter(|(u, _)| u.ncols() * (rows.len() + cols.len()) < rows.len() * cols.len());
        match aca {
            Some((u, vt)) => LeafData::LowRank { u, vt },
            None => {
                debug!(
                    "ACA rechazada en bloque {}x{}; ensamblado explícito",
                    rows.len(),
                    cols.len()
                );
                let block = assemble_block(ctx.mesh, ctx.tracer, &rows, &cols, false);
                compress_block(block, tol, ctx.config.max_rank)
            }
        }
    } else {
        let block = assemble_block(ctx.mesh, ctx.tracer, &rows, &cols, false);
        compress_block(block, tol, ctx.config.max_rank)
    };

    Ok(RawBlock::Leaf { rows, cols, data })
}

/// Aplana el árbol de bloques en una arena en preorden, calculando los
/// desplazamientos de cada hijo dentro de los conjuntos del padre
fn flatten(raw: RawBlock, nodes: &mut Vec<Block>) -> Result<usize, FluxError> {
    match raw {
        RawBlock::Leaf { rows, cols, data } => {
            let id = nodes.len();
            nodes.push(Block::Leaf { rows, cols, data });
            Ok(id)
        }
        RawBlock::Internal {
            rows,
            cols,
            children,
        } => {
            let id = nodes.len();
            nodes.push(Block::Internal {
                rows: rows.clone(),
                cols: cols.clone(),
                children: Vec::new(),
            });
            let mut refs = Vec::with_capacity(children.len());
            let mut row_off = 0_usize;
            let mut col_off = 0_usize;
            for child in children {
                let (crows, ccols) = match &child {
                    RawBlock::Leaf { rows, cols, .. } => (rows.len(), cols.len()),
                    RawBlock::Internal { rows, cols, .. } => (rows.len(), cols.len()),
                };
                let node = flatten(child, nodes)?;
                refs.push(ChildRef {
                    node,
                    row_off,
                    col_off,
                });
                col_off += ccols;
                if col_off == cols.len() {
                    col_off = 0;
                    row_off += crows;
                }
            }
            if row_off != rows.len() || col_off != 0 {
                return Err(FluxError::InvariantViolated(format!(
                    "los hijos no forman una partición del bloque {}x{}",
                    rows.len(),
                    cols.len()
                )));
            }
            if let Block::Internal { children, .. } = &mut nodes[id] {
                *children = refs;
            }
            Ok(id)
        }
    }
}
