// Copyright (c) 2018-2022 Rafael Villar Burke <pachi@ietcc.csic.es>
// Distributed under the MIT License
// (See acoompanying LICENSE file or a copy at http://opensource.org/licenses/MIT)

//! Tipos comunes: errores, avisos, configuración y cancelación cooperativa

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Errores del cálculo radiativo
#[derive(Debug, Clone, PartialEq)]
pub enum FluxError {
    /// Malla con caras degeneradas (área nula) o índices fuera de rango
    DegenerateMesh(String),
    /// No se ha podido construir la estructura de aceleración del oráculo
    OracleBuildFailed(String),
    /// Cancelación cooperativa solicitada por el llamante
    Cancelled,
    /// Flujo binario truncado, magia incorrecta, versión desconocida o checksum inválido
    SerializationError(String),
    /// El solver de Neumann no reduce el residuo dentro del número máximo de iteraciones
    NumericalBreakdown { iters: u32, residual: f32 },
    /// Fallo de consistencia interna. Indica un bug y es fatal
    InvariantViolated(String),
}

impl Display for FluxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use FluxError::*;
        match self {
            DegenerateMesh(msg) => write!(f, "Malla degenerada: {}", msg),
            OracleBuildFailed(msg) => write!(f, "Fallo al construir el oráculo de rayos: {}", msg),
            Cancelled => write!(f, "Operación cancelada"),
            SerializationError(msg) => write!(f, "Error de serialización: {}", msg),
            NumericalBreakdown { iters, residual } => write!(
                f,
                "El solver no converge tras {} iteraciones (residuo {})",
                iters, residual
            ),
            InvariantViolated(msg) => write!(f, "Invariante violada: {}", msg),
        }
    }
}

impl std::error::Error for FluxError {}

/// Nivel de aviso para los diagnósticos de ensamblado
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningLevel {
    DANGER,
    WARNING,
    INFO,
}

/// Muestra WarningLevel
impl Display for WarningLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use WarningLevel::*;
        let printable = match *self {
            DANGER => "DANGER",
            WARNING => "WARNING",
            _ => "INFO",
        };
        write!(f, "{}", printable)
    }
}

/// Reporte de avisos
///
/// Acumula diagnósticos no fatales (excesos de suma de fila, rechazos de
/// compresión, ...) que el llamante puede inspeccionar tras el ensamblado
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    /// Nivel de afectación
    pub level: WarningLevel,
    /// Id del elemento afectado (cara o bloque), en su caso
    pub id: Option<String>,
    /// Mensaje del aviso
    pub msg: String,
}

/// Tipo de oráculo de trazado de rayos
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    /// BVH en simple precisión
    Bvh,
    /// Árbol AABB en doble precisión (ruta tipo CGAL)
    Aabb,
}

/// Tipo de partición espacial de caras
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    /// Subdivisión en xy (proyección horizontal de centroides)
    Quadtree,
    /// Subdivisión en xyz
    Octree,
}

impl TreeKind {
    /// Número máximo de hijos por nodo
    pub fn arity(self) -> u8 {
        match self {
            TreeKind::Quadtree => 4,
            TreeKind::Octree => 8,
        }
    }
}

/// Perturbación ε del origen de los rayos para evitar autointersecciones
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EpsSelf {
    /// Valor global constante
    Global(f32),
    /// Valor global escalado por cara con √A
    SqrtArea,
}

/// ε por defecto: 10³ × resolución de float32 (1e-6)
pub const EPS_SELF_DEFAULT: f32 = 1e3 * 1e-6;

/// Configuración del ensamblado del operador de factores de forma
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormFactorConfig {
    /// Tolerancia relativa (norma de Frobenius) de aceptación de bloques de rango bajo
    pub tol: f64,
    /// Tamaño mínimo de bloque. No se subdividen nodos con <= min_size caras
    pub min_size: u32,
    /// Rango máximo de los bloques comprimidos (sin límite si None)
    pub max_rank: Option<u32>,
    /// Implementación del oráculo de rayos
    pub oracle: OracleKind,
    /// Exige orientación mutua de caras en el test de visibilidad
    pub oriented_visibility: bool,
    /// Perturbación del origen de rayos
    pub eps_self: EpsSelf,
    /// Paraleliza ensamblado, aplicación y consultas por lotes
    pub parallel: bool,
    /// Partición espacial para la descomposición por bloques
    pub tree: TreeKind,
}

impl Default for FormFactorConfig {
    fn default() -> Self {
        Self {
            tol: 1e-3,
            min_size: 512,
            max_rank: None,
            oracle: OracleKind::Bvh,
            oriented_visibility: true,
            eps_self: EpsSelf::Global(EPS_SELF_DEFAULT),
            parallel: true,
            tree: TreeKind::Quadtree,
        }
    }
}

/// Señal de cancelación cooperativa
///
/// Se comprueba en las fronteras de bloque durante el ensamblado y la
/// aplicación del operador. Compartible entre hilos
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Solicita la cancelación
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// ¿Se ha solicitado la cancelación?
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Devuelve `Err(Cancelled)` si se ha solicitado la cancelación
    pub fn check(&self) -> Result<(), FluxError> {
        if self.is_cancelled() {
            Err(FluxError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(FluxError::Cancelled));
    }

    #[test]
    fn default_config() {
        let cfg = FormFactorConfig::default();
        assert_eq!(cfg.min_size, 512);
        assert_eq!(cfg.oracle, OracleKind::Bvh);
        assert!(cfg.oriented_visibility);
        assert_eq!(cfg.tree.arity(), 4);
    }
}
