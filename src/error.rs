//! Reporte de errores de compilación.
//!
//! Todos los errores son fatales: el compilador no intenta
//! recuperarse, aborta la compilación y descarta la salida parcial.
//! Cada diagnóstico pertenece a una de cuatro categorías y lleva,
//! cuando se conoce, la posición original en el código fuente.

use crate::source::Position;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Categoría de un error de compilación.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Rechazo del lexer o del parser.
    Syntax,

    /// Declaraciones duplicadas o incompatibles.
    Declaration,

    /// Usos inválidos dentro de sentencias y expresiones.
    Statement,

    /// Falla interna del emisor de código.
    Compilation,
}

impl Display for Stage {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Syntax => "Syntax",
            Stage::Declaration => "Declaration",
            Stage::Statement => "Statement",
            Stage::Compilation => "Compilation",
        };

        fmt.write_str(name)
    }
}

/// Un diagnóstico fatal, con categoría y posición opcional.
#[non_exhaustive]
#[derive(Error, Debug)]
#[error("{}", render(.stage, .message, .position))]
pub struct Diagnostic {
    pub stage: Stage,
    pub message: String,
    pub position: Option<Position>,
}

fn render(stage: &Stage, message: &str, position: &Option<Position>) -> String {
    match position {
        Some(position) => format!("[{}] {}: {}", position, stage, message),
        None => format!("{}: {}", stage, message),
    }
}

impl Diagnostic {
    pub fn new<S: Into<String>>(stage: Stage, message: S, position: Option<Position>) -> Self {
        Diagnostic {
            stage,
            message: message.into(),
            position,
        }
    }

    /// Error interno del emisor, sin posición asociada.
    pub fn internal() -> Self {
        Diagnostic::new(Stage::Compilation, "Unexpected compiler error", None)
    }
}

pub type Compile<T> = Result<T, Diagnostic>;

pub fn syntax<S: Into<String>>(message: S, position: Position) -> Diagnostic {
    Diagnostic::new(Stage::Syntax, message, Some(position))
}

pub fn declaration<S: Into<String>>(message: S, position: Position) -> Diagnostic {
    Diagnostic::new(Stage::Declaration, message, Some(position))
}

pub fn statement<S: Into<String>>(message: S, position: Position) -> Diagnostic {
    Diagnostic::new(Stage::Statement, message, Some(position))
}

pub fn compilation<S: Into<String>>(message: S) -> Diagnostic {
    Diagnostic::new(Stage::Compilation, message, None)
}
