//! Compilador de una pasada que produce ejecutables MZ de 16 bits
//! para DOS con código i386.
//!
//! El análisis sintáctico construye directamente una representación
//! intermedia lineal a través del builder semántico; un postprocesador
//! marca las funciones alcanzables desde el punto de entrada; y el
//! emisor traduce la IR a bytes con asignación de registros sobre la
//! marcha, resolución de saltos cortos y largos, y las rutinas del
//! runtime que el programa referencie.

pub mod codegen;
pub mod error;
pub mod exe;
pub mod ir;
pub mod lex;
pub mod parse;
pub mod semantic;
pub mod source;
pub mod sym;

use std::path::Path;

/// Compila un programa fuente completo a una imagen MZ.
///
/// El directorio indicado es la base para resolver los `#include`
/// relativos del programa.
pub fn compile(source: &str, include_dir: &Path) -> error::Compile<Vec<u8>> {
    let lexer = lex::Lexer::new(source, include_dir);
    let mut program = parse::parse(lexer)?;
    codegen::emit(&mut program)
}
