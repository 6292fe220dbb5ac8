// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Matriz de factores de forma comprimida por bloques jerárquicos
//!
//! Partición espacial de caras, ensamblado de bloques densos, compresión de
//! rango bajo, operador jerárquico y serialización binaria

mod block;
mod lowrank;
mod operator;
mod quadtree;
mod serialize;

pub use block::{assemble_block, form_factor_entry, full_form_factor_matrix};
pub use lowrank::{aca_approximation, compress_block, CsrMatrix, LeafData};
pub use operator::{AssemblyStats, Block, ChildRef, CompressedFormFactor};
pub use quadtree::{build_face_tree, FaceNode};
