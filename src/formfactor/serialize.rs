// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Serialización binaria del operador comprimido (formato FFM1)
//!
//! Flujo autodescriptivo little-endian:
//! - magia `FFM1`
//! - cabecera: versión (u32), N (u64), τ (f64), min_size (u32), aridad (u8)
//! - árbol en preorden; cada nodo empieza con un byte de tipo:
//!   - 0x00 intermedio: número de hijos (u8) y, por hijo, descriptor del
//!     conjunto de filas (u32 número + índices u32), descriptor de columnas
//!     y el subárbol del hijo
//!   - 0x01 hoja densa: forma (u32, u32) y entradas f32 por filas
//!   - 0x02 hoja dispersa: CSR (nnz u64, indptr, indices, data)
//!   - 0x03 hoja de rango bajo: rango r (u32), U y Vᵀ en f32 por filas
//!   - 0x04 hoja nula: sin payload
//! - pie: SHA-256 de los bytes precedentes (opcional: se aceptan flujos sin él)
//!
//! La rehidratación reproduce un operador bit-idéntico (estructura del árbol
//! y payloads). Los conjuntos de índices de la raíz no se escriben: una raíz
//! intermedia los reconstruye concatenando los de sus hijos y una raíz hoja
//! usa la identidad 0..N. Las estadísticas de ensamblado no forman parte del
//! flujo y se recalculan al cargar (los avisos no se conservan).

use std::io::{Read, Write};

use sha2::{Digest, Sha256};

use super::lowrank::{CsrMatrix, LeafData};
use super::operator::{Block, ChildRef, CompressedFormFactor};
use crate::common::FluxError;

const MAGIC: &[u8; 4] = b"FFM1";
const FORMAT_VERSION: u32 = 1;

const TAG_INTERNAL: u8 = 0x00;
const TAG_DENSE: u8 = 0x01;
const TAG_SPARSE: u8 = 0x02;
const TAG_LOWRANK: u8 = 0x03;
const TAG_ZERO: u8 = 0x04;

impl CompressedFormFactor {
    /// Serializa el operador, con pie SHA-256, al escritor dado
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), FluxError> {
        let bytes = self.save_to_vec();
        writer
            .write_all(&bytes)
            .map_err(|e| FluxError::SerializationError(format!("error de escritura: {}", e)))
    }

    /// Serializa el operador a un vector de bytes, con pie SHA-256
    pub fn save_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        push_u32(&mut buf, FORMAT_VERSION);
        push_u64(&mut buf, self.num_faces() as u64);
        push_f64(&mut buf, self.tol());
        push_u32(&mut buf, self.min_size());
        buf.push(self.arity());
        write_node(&mut buf, self.nodes(), 0);
        let digest = Sha256::digest(&buf);
        buf.extend_from_slice(digest.as_slice());
        buf
    }

    /// Rehidrata un operador desde el lector dado
    pub fn load<R: Read>(reader: &mut R) -> Result<Self, FluxError> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| FluxError::SerializationError(format!("error de lectura: {}", e)))?;
        Self::load_from_slice(&bytes)
    }

    /// Rehidrata un operador desde un slice de bytes
    pub fn load_from_slice(bytes: &[u8]) -> Result<Self, FluxError> {
        let mut r = Reader::new(bytes);
        let magic = r.take(4)?;
        if magic != MAGIC {
            return Err(FluxError::SerializationError(
                "magia incorrecta (se esperaba FFM1)".to_string(),
            ));
        }
        let version = r.read_u32()?;
        if version != FORMAT_VERSION {
            return Err(FluxError::SerializationError(format!(
                "versión de formato desconocida: {}",
                version
            )));
        }
        let num_faces = r.read_u64()? as usize;
        let tol = r.read_f64()?;
        let min_size = r.read_u32()?;
        let arity = r.read_u8()?;
        if arity != 4 && arity != 8 {
            return Err(FluxError::SerializationError(format!(
                "aridad de árbol no admitida: {}",
                arity
            )));
        }

        let mut nodes = Vec::new();
        read_node(&mut r, &mut nodes, None, num_faces)?;

        // pie opcional: SHA-256 de los bytes precedentes
        let consumed = r.pos;
        let rest = bytes.len() - consumed;
        if rest == 32 {
            let digest = Sha256::digest(&bytes[..consumed]);
            if digest.as_slice() != &bytes[consumed..] {
                return Err(FluxError::SerializationError(
                    "el checksum SHA-256 no coincide".to_string(),
                ));
            }
        } else if rest != 0 {
            return Err(FluxError::SerializationError(format!(
                "{} bytes residuales tras el árbol",
                rest
            )));
        }

        Ok(Self::from_parts(num_faces, tol, min_size, arity, nodes))
    }
}

// ------------------------------ Escritura ----------------------------------

fn write_node(buf: &mut Vec<u8>, nodes: &[Block], id: usize) {
    match &nodes[id] {
        Block::Internal { children, .. } => {
            buf.push(TAG_INTERNAL);
            buf.push(children.len() as u8);
            for child in children {
                let node = &nodes[child.node];
                write_index_set(buf, node.rows());
                write_index_set(buf, node.cols());
                write_node(buf, nodes, child.node);
            }
        }
        Block::Leaf { rows, cols, data } => match data {
            LeafData::Dense(m) => {
                buf.push(TAG_DENSE);
                push_u32(buf, rows.len() as u32);
                push_u32(buf, cols.len() as u32);
                for p in 0..m.nrows() {
                    for q in 0..m.ncols() {
                        push_f32(buf, m[(p, q)]);
                    }
                }
            }
            LeafData::Sparse(m) => {
                buf.push(TAG_SPARSE);
                push_u64(buf, m.nnz() as u64);
                for &v in &m.indptr {
                    push_u64(buf, v);
                }
                for &v in &m.indices {
                    push_u32(buf, v);
                }
                for &v in &m.data {
                    push_f32(buf, v);
                }
            }
            LeafData::LowRank { u, vt } => {
                buf.push(TAG_LOWRANK);
                push_u32(buf, u.ncols() as u32);
                for p in 0..u.nrows() {
                    for k in 0..u.ncols() {
                        push_f32(buf, u[(p, k)]);
                    }
                }
                for k in 0..vt.nrows() {
                    for q in 0..vt.ncols() {
                        push_f32(buf, vt[(k, q)]);
                    }
                }
            }
            LeafData::Zero => buf.push(TAG_ZERO),
        },
    }
}

fn write_index_set(buf: &mut Vec<u8>, set: &[u32]) {
    push_u32(buf, set.len() as u32);
    for &v in set {
        push_u32(buf, v);
    }
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

// ------------------------------- Lectura -----------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FluxError> {
        if self.pos + n > self.buf.len() {
            return Err(FluxError::SerializationError(
                "flujo truncado".to_string(),
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, FluxError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, FluxError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, FluxError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_f32(&mut self) -> Result<f32, FluxError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self) -> Result<f64, FluxError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_index_set(&mut self) -> Result<Vec<u32>, FluxError> {
        let count = self.read_u32()? as usize;
        let mut set = Vec::with_capacity(count);
        for _ in 0..count {
            set.push(self.read_u32()?);
        }
        Ok(set)
    }
}

/// Lee un nodo y su subárbol, insertándolos en la arena en preorden
///
/// `expected` lleva los conjuntos de índices anunciados por el padre (None en
/// la raíz). Para un nodo intermedio los conjuntos propios se reconstruyen
/// concatenando los de sus hijos y se verifican contra los anunciados; la
/// discrepancia es un fallo de invariante, no de formato
fn read_node(
    r: &mut Reader,
    nodes: &mut Vec<Block>,
    expected: Option<(Vec<u32>, Vec<u32>)>,
    num_faces: usize,
) -> Result<usize, FluxError> {
    let tag = r.read_u8()?;
    if tag == TAG_INTERNAL {
        let id = nodes.len();
        nodes.push(Block::Internal {
            rows: Vec::new(),
            cols: Vec::new(),
            children: Vec::new(),
        });
        let count = r.read_u8()? as usize;
        if count == 0 {
            return Err(FluxError::SerializationError(
                "nodo intermedio sin hijos".to_string(),
            ));
        }
        // los hijos vienen en orden row-major: grupos que comparten conjunto
        // de filas y recorren la partición de columnas completa
        let mut refs: Vec<ChildRef> = Vec::with_capacity(count);
        let mut rows: Vec<u32> = Vec::new();
        let mut cols: Vec<u32> = Vec::new();
        let mut row_off = 0_usize;
        let mut col_off = 0_usize;
        let mut group_rows: Option<Vec<u32>> = None;
        for _ in 0..count {
            let crows = r.read_index_set()?;
            let ccols = r.read_index_set()?;
            match &group_rows {
                None => {
                    rows.extend_from_slice(&crows);
                    group_rows = Some(crows.clone());
                }
                Some(g) if *g != crows => {
                    // empieza un nuevo grupo de filas: el anterior debe haber
                    // agotado la partición de columnas
                    if col_off != cols.len() {
                        return Err(FluxError::InvariantViolated(
                            "grupo de filas incompleto en bloque intermedio".to_string(),
                        ));
                    }
                    row_off += g.len();
                    col_off = 0;
                    rows.extend_from_slice(&crows);
                    group_rows = Some(crows.clone());
                }
                Some(_) => {}
            }
            if row_off == 0 {
                // el primer grupo define la partición de columnas del padre
                cols.extend_from_slice(&ccols);
            } else if col_off + ccols.len() > cols.len()
                || cols[col_off..col_off + ccols.len()] != ccols[..]
            {
                return Err(FluxError::InvariantViolated(
                    "las columnas del hijo no coinciden con las del padre".to_string(),
                ));
            }

            let ccols_len = ccols.len();
            let child = read_node(r, nodes, Some((crows, ccols)), num_faces)?;
            refs.push(ChildRef {
                node: child,
                row_off,
                col_off,
            });
            col_off += ccols_len;
        }
        if col_off != cols.len() || rows.is_empty() {
            return Err(FluxError::InvariantViolated(
                "los hijos no forman una partición del bloque".to_string(),
            ));
        }
        if let Some((erows, ecols)) = expected {
            if erows != rows || ecols != cols {
                return Err(FluxError::InvariantViolated(
                    "los conjuntos del nodo no coinciden con los anunciados por su padre"
                        .to_string(),
                ));
            }
        }
        if let Block::Internal {
            rows: nrows,
            cols: ncols,
            children,
        } = &mut nodes[id]
        {
            *nrows = rows;
            *ncols = cols;
            *children = refs;
        }
        Ok(id)
    } else {
        // hoja: los conjuntos vienen del padre (identidad 0..N en una raíz hoja)
        let (rows, cols) = match expected {
            Some(sets) => sets,
            None => {
                let identity: Vec<u32> = (0..num_faces as u32).collect();
                (identity.clone(), identity)
            }
        };
        let data = match tag {
            TAG_DENSE => {
                let nrows = r.read_u32()? as usize;
                let ncols = r.read_u32()? as usize;
                if nrows != rows.len() || ncols != cols.len() {
                    return Err(FluxError::SerializationError(format!(
                        "forma de hoja densa {}x{} incompatible con sus índices {}x{}",
                        nrows,
                        ncols,
                        rows.len(),
                        cols.len()
                    )));
                }
                let mut m = nalgebra::DMatrix::zeros(nrows, ncols);
                for p in 0..nrows {
                    for q in 0..ncols {
                        m[(p, q)] = r.read_f32()?;
                    }
                }
                LeafData::Dense(m)
            }
            TAG_SPARSE => {
                let nnz = r.read_u64()? as usize;
                let mut indptr = Vec::with_capacity(rows.len() + 1);
                for _ in 0..rows.len() + 1 {
                    indptr.push(r.read_u64()?);
                }
                if indptr.last() != Some(&(nnz as u64)) {
                    return Err(FluxError::SerializationError(
                        "CSR inconsistente: indptr no termina en nnz".to_string(),
                    ));
                }
                let mut indices = Vec::with_capacity(nnz);
                for _ in 0..nnz {
                    let j = r.read_u32()?;
                    if j as usize >= cols.len() {
                        return Err(FluxError::SerializationError(
                            "CSR inconsistente: índice de columna fuera de rango".to_string(),
                        ));
                    }
                    indices.push(j);
                }
                let mut data = Vec::with_capacity(nnz);
                for _ in 0..nnz {
                    data.push(r.read_f32()?);
                }
                LeafData::Sparse(CsrMatrix {
                    nrows: rows.len(),
                    ncols: cols.len(),
                    indptr,
                    indices,
                    data,
                })
            }
            TAG_LOWRANK => {
                let rank = r.read_u32()? as usize;
                let mut u = nalgebra::DMatrix::zeros(rows.len(), rank);
                for p in 0..rows.len() {
                    for k in 0..rank {
                        u[(p, k)] = r.read_f32()?;
                    }
                }
                let mut vt = nalgebra::DMatrix::zeros(rank, cols.len());
                for k in 0..rank {
                    for q in 0..cols.len() {
                        vt[(k, q)] = r.read_f32()?;
                    }
                }
                LeafData::LowRank { u, vt }
            }
            TAG_ZERO => LeafData::Zero,
            other => {
                return Err(FluxError::SerializationError(format!(
                    "tipo de nodo desconocido: 0x{:02x}",
                    other
                )))
            }
        };
        let id = nodes.len();
        nodes.push(Block::Leaf { rows, cols, data });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FormFactorConfig;
    use crate::geometry::TriMesh;
    use crate::point;
    use crate::Point3;
    use nalgebra::DVector;

    /// Rejilla de terreno con dos niveles, suficiente para varios bloques
    fn terrain_mesh(n: usize) -> TriMesh {
        let mut vertices: Vec<Point3> = Vec::new();
        let mut faces = Vec::new();
        for i in 0..=n {
            for j in 0..=n {
                // pequeña depresión central para producir visibilidad mutua
                let x = i as f32;
                let y = j as f32;
                let r2 = (x - n as f32 / 2.0).powi(2) + (y - n as f32 / 2.0).powi(2);
                let z = -(n as f32 / 2.0 - r2.sqrt()).max(0.0);
                vertices.push(point![x, y, z]);
            }
        }
        let stride = (n + 1) as u32;
        for i in 0..n as u32 {
            for j in 0..n as u32 {
                let v00 = i * stride + j;
                let v10 = v00 + stride;
                let v01 = v00 + 1;
                let v11 = v10 + 1;
                faces.push([v00, v10, v01]);
                faces.push([v10, v11, v01]);
            }
        }
        TriMesh::new(vertices, faces).unwrap()
    }

    fn build_operator() -> CompressedFormFactor {
        let mesh = terrain_mesh(8);
        let config = FormFactorConfig {
            min_size: 16,
            parallel: false,
            ..Default::default()
        };
        CompressedFormFactor::assemble(&mesh, &config, None).unwrap()
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let ff = build_operator();
        let bytes = ff.save_to_vec();
        let reloaded = CompressedFormFactor::load_from_slice(&bytes).unwrap();
        let bytes2 = reloaded.save_to_vec();
        assert_eq!(bytes, bytes2);
        // y el operador rehidratado aplica igual
        let x = DVector::from_fn(ff.num_faces(), |i, _| (i % 7) as f32 * 0.25);
        let y1 = ff.apply(&x, None).unwrap();
        let y2 = reloaded.apply(&x, None).unwrap();
        assert_eq!(y1, y2);
    }

    #[test]
    fn accepts_stream_without_footer() {
        let ff = build_operator();
        let bytes = ff.save_to_vec();
        let without_footer = &bytes[..bytes.len() - 32];
        let reloaded = CompressedFormFactor::load_from_slice(without_footer).unwrap();
        assert_eq!(reloaded.num_faces(), ff.num_faces());
    }

    #[test]
    fn roundtrip_with_single_leaf_root() {
        // min_size mayor que N: el árbol es una única hoja raíz con
        // conjuntos identidad implícitos
        let mesh = terrain_mesh(3);
        let config = FormFactorConfig {
            min_size: 64,
            parallel: false,
            ..Default::default()
        };
        let ff = CompressedFormFactor::assemble(&mesh, &config, None).unwrap();
        assert_eq!(ff.depth(), 1);
        let bytes = ff.save_to_vec();
        let reloaded = CompressedFormFactor::load_from_slice(&bytes).unwrap();
        assert_eq!(bytes, reloaded.save_to_vec());
    }

    #[test]
    fn rejects_bad_magic() {
        let ff = build_operator();
        let mut bytes = ff.save_to_vec();
        bytes[0] = b'X';
        assert!(matches!(
            CompressedFormFactor::load_from_slice(&bytes),
            Err(FluxError::SerializationError(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let ff = build_operator();
        let mut bytes = ff.save_to_vec();
        bytes[4] = 99;
        assert!(matches!(
            CompressedFormFactor::load_from_slice(&bytes),
            Err(FluxError::SerializationError(_))
        ));
    }

    #[test]
    fn rejects_truncated_stream() {
        let ff = build_operator();
        let bytes = ff.save_to_vec();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            CompressedFormFactor::load_from_slice(truncated),
            Err(FluxError::SerializationError(_))
        ));
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let ff = build_operator();
        let mut bytes = ff.save_to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            CompressedFormFactor::load_from_slice(&bytes),
            Err(FluxError::SerializationError(_))
        ));
    }
}
