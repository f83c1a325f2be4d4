//! Representación intermedia de código.
//!
//! La representación intermedia es lineal: un vector de instrucciones
//! de tres direcciones cuyo IP abstracto es su posición con base 0.
//! El parser la construye en una sola pasada hacia adelante; los
//! saltos hacia adelante quedan pendientes en listas de backpatch que
//! el builder resuelve cuando el destino se conoce.
//!
//! # Operandos
//! Un operando es una constante resuelta o el nombre de una variable,
//! junto con su tipo. Un operando puede llevar un índice opcional para
//! accesos de la forma `p[i]`.
//!
//! # Backpatch
//! Una lista de backpatch almacena índices dentro del vector de
//! instrucciones en lugar de punteros; concatenar dos listas es
//! concatenar los vectores.

use crate::sym::{ExpressionType, SymbolType};

/// Índice opcional de un operando o destino indexado.
#[derive(Clone, Debug, PartialEq)]
pub struct OperandIndex {
    pub value: String,
    pub typ: SymbolType,
    pub exp_type: ExpressionType,
}

/// Un operando de instrucción.
#[derive(Clone, Debug, PartialEq)]
pub struct Operand {
    pub value: String,
    pub typ: SymbolType,
    pub exp_type: ExpressionType,
    pub index: Option<OperandIndex>,
}

impl Operand {
    pub fn constant<S: Into<String>>(value: S, typ: SymbolType) -> Self {
        Operand {
            value: value.into(),
            typ,
            exp_type: ExpressionType::Constant,
            index: None,
        }
    }

    pub fn variable<S: Into<String>>(value: S, typ: SymbolType) -> Self {
        Operand {
            value: value.into(),
            typ,
            exp_type: ExpressionType::Variable,
            index: None,
        }
    }

    /// Valor numérico de un operando constante.
    pub fn constant_value(&self) -> i32 {
        parse_constant(&self.value)
    }
}

/// Interpreta el texto de una constante numérica. Los valores se
/// truncan a 32 bits sin signo.
pub fn parse_constant(text: &str) -> i32 {
    text.parse::<i64>().unwrap_or(0) as u32 as i32
}

/// Operación de una instrucción de asignación.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AssignOp {
    /// Copia simple.
    None,
    Negation,

    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    ShiftLeft,
    ShiftRight,
}

/// Comparación de una instrucción condicional.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompareOp {
    LogOr,
    LogAnd,

    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
}

impl CompareOp {
    /// Comparación equivalente con los operandos intercambiados.
    pub fn swapped(self) -> CompareOp {
        match self {
            CompareOp::Greater => CompareOp::Less,
            CompareOp::Less => CompareOp::Greater,
            CompareOp::GreaterOrEqual => CompareOp::LessOrEqual,
            CompareOp::LessOrEqual => CompareOp::GreaterOrEqual,
            other => other,
        }
    }

    /// Evalúa la comparación entre dos constantes.
    pub fn constexpr(self, op1: i32, op2: i32) -> bool {
        let (a, b) = (op1 as u32, op2 as u32);
        match self {
            CompareOp::LogOr => a != 0 || b != 0,
            CompareOp::LogAnd => a != 0 && b != 0,
            CompareOp::Equal => a == b,
            CompareOp::NotEqual => a != b,
            CompareOp::Greater => a > b,
            CompareOp::Less => a < b,
            CompareOp::GreaterOrEqual => a >= b,
            CompareOp::LessOrEqual => a <= b,
        }
    }
}

/// Una instrucción de representación intermedia.
#[derive(Clone, Debug)]
pub enum Instruction {
    Nop,

    Assign {
        op: AssignOp,
        dst: String,
        dst_index: Option<OperandIndex>,
        op1: Operand,
        op2: Option<Operand>,
    },

    /// Salto incondicional a un IP abstracto.
    Goto { target: i32 },

    /// Salto incondicional a una etiqueta con nombre; el emisor la
    /// resuelve dentro de la función actual.
    GotoLabel { label: String },

    /// Salto condicional a un IP abstracto.
    If {
        op: CompareOp,
        op1: Operand,
        op2: Operand,
        target: i32,
    },

    /// Encola un parámetro para la próxima llamada.
    Push { operand: Operand },

    /// Llama a un invocable; el valor de retorno, si existe, queda en
    /// la variable indicada.
    Call {
        target: String,
        return_symbol: Option<String>,
    },

    Return { operand: Option<Operand> },
}

/// Lista de instrucciones pendientes de destino, como índices dentro
/// del vector de instrucciones.
pub type BackpatchList = Vec<usize>;

/// Concatena dos listas de backpatch.
pub fn merge_lists(mut a: BackpatchList, mut b: BackpatchList) -> BackpatchList {
    a.append(&mut b);
    a
}
