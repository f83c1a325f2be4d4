//! Análisis sintáctico.
//!
//! El parser es de descenso recursivo y trabaja en una sola pasada
//! hacia adelante: no construye un AST, sino que invoca las
//! operaciones del [`Builder`] en orden de aparición del código
//! fuente, haciendo crecer directamente la representación intermedia.
//!
//! El control de flujo hacia adelante (condicionales, ciclos, `goto`)
//! se resuelve con listas de backpatch: cada comparación produce una
//! lista de saltos "verdadero" y una lista "falso" cuyos destinos se
//! asignan cuando el punto correspondiente del programa se alcanza.
//! Una expresión corto-circuito usada como valor materializa un
//! temporal booleano inicializado en 0 cuya lista verdadera apunta a
//! una instrucción que le asigna 1.

use crate::error::{statement, syntax, Compile, Diagnostic};
use crate::ir::{
    merge_lists, AssignOp, BackpatchList, CompareOp, Instruction, Operand, OperandIndex,
};
use crate::lex::{Keyword, Lexer, Token};
use crate::semantic::{Builder, Program, ScopeType, ENTRY_POINT_NAME};
use crate::source::{Located, Position};
use crate::sym::{
    self, can_explicit_cast, can_implicit_cast, largest_arithmetic_type, size_of,
    smallest_type_for, BaseType, ExpressionType, SymbolType, BOOL, STRING, UINT32, VOID_PTR,
};

use std::collections::VecDeque;

/// Límite superior del tamaño declarado de un arreglo.
const MAX_ARRAY_SIZE: u32 = 65535;

/// Analiza el flujo de tokens completo y produce el programa en
/// representación intermedia, ya postprocesado.
pub fn parse(lexer: Lexer) -> Compile<Program> {
    let mut parser = Parser {
        lexer,
        lookahead: VecDeque::new(),
        position: Position::default(),
    };

    let mut builder = Builder::new();

    while parser.peek()?.is_some() {
        parser.parse_top_level(&mut builder)?;
    }

    let has_entry_point = builder
        .symbols()
        .iter()
        .any(|s| s.typ.base == BaseType::EntryPoint);
    if !has_entry_point {
        return Err(crate::error::declaration(
            format!("Entry point \"{}\" was not found", ENTRY_POINT_NAME),
            parser.position,
        ));
    }

    builder.postprocess()?;

    Ok(builder.finish(parser.lexer.stack_size()))
}

/// Resultado del análisis de una expresión: un operando más las
/// listas de backpatch cuando la expresión tiene semántica de
/// corto-circuito.
struct Exp {
    op: Operand,
    true_list: BackpatchList,
    false_list: BackpatchList,

    /// Temporal booleano preasignado en 0, si la condición se creó
    /// dentro de un contexto de asignación.
    temp: Option<String>,
}

impl Exp {
    fn value(op: Operand) -> Self {
        Exp {
            op,
            true_list: Vec::new(),
            false_list: Vec::new(),
            temp: None,
        }
    }

    fn has_lists(&self) -> bool {
        !self.true_list.is_empty() || !self.false_list.is_empty()
    }
}

struct Parser {
    lexer: Lexer,
    lookahead: VecDeque<Located<Token>>,
    position: Position,
}

impl Parser {
    fn fill(&mut self, count: usize) -> Compile<()> {
        while self.lookahead.len() < count {
            match self.lexer.next() {
                Some(token) => self.lookahead.push_back(token?),
                None => break,
            }
        }

        Ok(())
    }

    fn peek(&mut self) -> Compile<Option<&Token>> {
        self.fill(1)?;
        Ok(self.lookahead.front().map(Located::val))
    }

    fn peek_second(&mut self) -> Compile<Option<&Token>> {
        self.fill(2)?;
        Ok(self.lookahead.get(1).map(Located::val))
    }

    fn next(&mut self) -> Compile<Option<Located<Token>>> {
        self.fill(1)?;
        let token = self.lookahead.pop_front();
        if let Some(token) = &token {
            self.position = token.position();
        }

        Ok(token)
    }

    fn eat(&mut self, expected: &Token) -> Compile<bool> {
        if self.peek()? == Some(expected) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, expected: Token) -> Compile<Position> {
        match self.next()? {
            Some(token) if *token.val() == expected => Ok(token.position()),
            Some(token) => Err(syntax(
                format!("Expected {:?}, found {:?}", expected, token.val()),
                token.position(),
            )),
            None => Err(syntax(
                format!("Expected {:?}, found end of input", expected),
                self.position,
            )),
        }
    }

    fn expect_id(&mut self) -> Compile<Located<String>> {
        match self.next()? {
            Some(token) => {
                let position = token.position();
                match token.into_inner() {
                    Token::Id(name) => Ok(Located::at(name, position)),
                    token => Err(syntax(
                        format!("Expected identifier, found {:?}", token),
                        position,
                    )),
                }
            }
            None => Err(syntax(
                "Expected identifier, found end of input",
                self.position,
            )),
        }
    }

    fn peek_is_type(&mut self) -> Compile<bool> {
        Ok(matches!(
            self.peek()?,
            Some(Token::Keyword(
                Keyword::Void
                    | Keyword::Bool
                    | Keyword::Uint8
                    | Keyword::Uint16
                    | Keyword::Uint32
                    | Keyword::StringType
            ))
        ))
    }

    /// Tipo base más niveles de indirección: `uint8`, `void*`, ...
    fn parse_type(&mut self) -> Compile<SymbolType> {
        let token = self.next()?;
        let (position, token) = match token {
            Some(token) => token.split(),
            None => {
                return Err(syntax("Expected type, found end of input", self.position))
            }
        };

        let base = match token {
            Token::Keyword(Keyword::Void) => BaseType::Void,
            Token::Keyword(Keyword::Bool) => BaseType::Bool,
            Token::Keyword(Keyword::Uint8) => BaseType::Uint8,
            Token::Keyword(Keyword::Uint16) => BaseType::Uint16,
            Token::Keyword(Keyword::Uint32) => BaseType::Uint32,
            Token::Keyword(Keyword::StringType) => BaseType::String,
            token => {
                return Err(syntax(format!("Expected type, found {:?}", token), position))
            }
        };

        let mut pointer = 0u8;
        while self.eat(&Token::Star)? {
            if pointer == u8::MAX {
                return Err(syntax("Too many levels of indirection", position));
            }
            pointer += 1;
        }

        Ok(SymbolType { base, pointer })
    }

    /// Tamaño declarado de un arreglo: `<N>` con 1 ≤ N ≤ 65535.
    fn parse_array_size(&mut self) -> Compile<i32> {
        let position = self.expect(Token::Less)?;
        let size = match self.next()?.map(Located::split) {
            Some((_, Token::IntLiteral(size))) => size,
            _ => return Err(syntax("Expected array size", position)),
        };
        self.expect(Token::Greater)?;

        if size == 0 || size > MAX_ARRAY_SIZE {
            return Err(crate::error::declaration(
                "Array size is out of bounds",
                position,
            ));
        }

        Ok(size as i32)
    }

    // ------------------------------------------------------------------
    // Declaraciones de nivel superior

    fn parse_top_level(&mut self, b: &mut Builder) -> Compile<()> {
        let is_const = self.eat(&Token::Keyword(Keyword::Const))?;
        let is_static = self.eat(&Token::Keyword(Keyword::Static))?;

        if !self.peek_is_type()? {
            let position = self.position;
            return Err(syntax("Expected declaration", position));
        }

        let typ = self.parse_type()?;

        // Forma de arreglo: T<N> nombre;
        if self.peek()? == Some(&Token::Less) {
            let size = self.parse_array_size()?;
            let name = self.expect_id()?;
            self.expect(Token::Semicolon)?;

            if is_const {
                return Err(crate::error::declaration(
                    "Arrays cannot be declared constant",
                    name.position(),
                ));
            }

            check_storage_type(typ, name.position())?;
            return b.add_static_variable(typ.reference(), size, name.val(), name.position());
        }

        let name = self.expect_id()?;

        if self.peek()? == Some(&Token::OpenParen) {
            if is_const || is_static {
                return Err(syntax(
                    "Functions cannot be declared const or static",
                    name.position(),
                ));
            }

            return self.parse_function(b, typ, name);
        }

        // Variable estática, con valor constante opcional
        if is_const {
            self.expect(Token::Assign)?;
            let constant = self.parse_constant_literal(typ, name.position())?;
            self.expect(Token::Semicolon)?;

            check_storage_type(typ, name.position())?;
            b.add_static_variable(typ, 0, name.val(), name.position())?;
            b.set_static_constant(name.val(), constant);
            return Ok(());
        }

        self.expect(Token::Semicolon)?;
        check_storage_type(typ, name.position())?;
        b.add_static_variable(typ, 0, name.val(), name.position())
    }

    /// Literal constante para inicializar una declaración `const`.
    fn parse_constant_literal(
        &mut self,
        expected: SymbolType,
        position: Position,
    ) -> Compile<String> {
        let constant = self.parse_case_value(position)?;

        if !can_implicit_cast(expected, constant.typ, ExpressionType::Constant) {
            return Err(statement(
                format!(
                    "Cannot initialize \"{}\" constant with \"{}\" value",
                    expected, constant.typ
                ),
                position,
            ));
        }

        Ok(constant.value)
    }

    fn parse_function(
        &mut self,
        b: &mut Builder,
        return_type: SymbolType,
        name: Located<String>,
    ) -> Compile<()> {
        self.expect(Token::OpenParen)?;

        if !self.eat(&Token::CloseParen)? {
            loop {
                let typ = self.parse_type()?;
                let parameter = self.expect_id()?;
                check_storage_type(typ, parameter.position())?;
                b.to_parameter(typ, parameter.val(), parameter.position())?;

                if self.eat(&Token::Comma)? {
                    continue;
                }
                self.expect(Token::CloseParen)?;
                break;
            }
        }

        if self.eat(&Token::Semicolon)? {
            return b.add_function_prototype(name.val(), return_type, name.position());
        }

        self.expect(Token::OpenCurly)?;
        while !self.eat(&Token::CloseCurly)? {
            if self.peek()?.is_none() {
                return Err(syntax("Unexpected end of input in function body", self.position));
            }
            self.parse_statement(b)?;
        }

        b.add_function(name.val(), return_type, name.position())
    }

    // ------------------------------------------------------------------
    // Sentencias

    fn parse_statement(&mut self, b: &mut Builder) -> Compile<()> {
        match self.peek()? {
            Some(Token::OpenCurly) => {
                self.next()?;
                while !self.eat(&Token::CloseCurly)? {
                    if self.peek()?.is_none() {
                        return Err(syntax("Unexpected end of input in block", self.position));
                    }
                    self.parse_statement(b)?;
                }
                Ok(())
            }

            Some(Token::Semicolon) => {
                self.next()?;
                Ok(())
            }

            Some(Token::Keyword(Keyword::Const)) => {
                self.next()?;
                let typ = self.parse_type()?;
                let name = self.expect_id()?;
                self.expect(Token::Assign)?;
                let constant = self.parse_constant_literal(typ, name.position())?;
                self.expect(Token::Semicolon)?;

                check_storage_type(typ, name.position())?;
                b.to_declaration(typ, 0, name.val(), ExpressionType::Variable, name.position())?;
                b.set_declaration_constant(name.val(), constant);
                Ok(())
            }

            Some(Token::Keyword(
                Keyword::Void
                | Keyword::Bool
                | Keyword::Uint8
                | Keyword::Uint16
                | Keyword::Uint32
                | Keyword::StringType,
            )) => self.parse_local_declaration(b),

            Some(Token::Keyword(Keyword::If)) => self.parse_if(b),
            Some(Token::Keyword(Keyword::While)) => self.parse_while(b),
            Some(Token::Keyword(Keyword::Do)) => self.parse_do_while(b),
            Some(Token::Keyword(Keyword::For)) => self.parse_for(b),
            Some(Token::Keyword(Keyword::Switch)) => self.parse_switch(b),
            Some(Token::Keyword(Keyword::Return)) => self.parse_return(b),

            Some(Token::Keyword(Keyword::Break)) => {
                let position = self.next()?.unwrap().position();
                self.expect(Token::Semicolon)?;

                let list = b.emit_with_backpatch(Instruction::Goto { target: -1 });
                if !b.add_to_scope(ScopeType::Break, list) {
                    return Err(statement(
                        "\"break\" is used outside of loop or switch",
                        position,
                    ));
                }
                Ok(())
            }

            Some(Token::Keyword(Keyword::Continue)) => {
                let position = self.next()?.unwrap().position();
                self.expect(Token::Semicolon)?;

                let list = b.emit_with_backpatch(Instruction::Goto { target: -1 });
                if !b.add_to_scope(ScopeType::Continue, list) {
                    return Err(statement("\"continue\" is used outside of loop", position));
                }
                Ok(())
            }

            Some(Token::Keyword(Keyword::Goto)) => {
                self.next()?;
                let label = self.expect_id()?;
                self.expect(Token::Semicolon)?;

                b.emit(Instruction::GotoLabel {
                    label: label.into_inner(),
                });
                Ok(())
            }

            Some(Token::Id(_)) => {
                if self.peek_second()? == Some(&Token::Colon) {
                    // Etiqueta local
                    let name = self.expect_id()?;
                    self.expect(Token::Colon)?;
                    return b.add_label(name.val(), b.next_ip(), name.position());
                }

                self.parse_simple_statement(b)?;
                self.expect(Token::Semicolon)?;
                Ok(())
            }

            Some(token) => {
                let message = format!("Unexpected {:?}", token);
                let position = self.position;
                Err(syntax(message, position))
            }
            None => Err(syntax("Unexpected end of input", self.position)),
        }
    }

    fn parse_local_declaration(&mut self, b: &mut Builder) -> Compile<()> {
        let typ = self.parse_type()?;

        if self.peek()? == Some(&Token::Less) {
            let size = self.parse_array_size()?;
            let name = self.expect_id()?;
            self.expect(Token::Semicolon)?;

            check_storage_type(typ, name.position())?;
            return b.to_declaration(
                typ.reference(),
                size,
                name.val(),
                ExpressionType::Variable,
                name.position(),
            );
        }

        let name = self.expect_id()?;
        check_storage_type(typ, name.position())?;
        b.to_declaration(typ, 0, name.val(), ExpressionType::Variable, name.position())?;

        if self.eat(&Token::Assign)? {
            self.parse_assignment_tail(b, name.val().clone(), typ, None, name.position())?;
        }

        self.expect(Token::Semicolon)?;
        Ok(())
    }

    /// Asignación, asignación indexada o llamada como sentencia. No
    /// consume el `;` final para poder reutilizarse en `for`.
    fn parse_simple_statement(&mut self, b: &mut Builder) -> Compile<()> {
        let name = self.expect_id()?;

        match self.peek()? {
            Some(Token::OpenParen) => {
                self.next()?;
                self.parse_call(b, name.val().clone(), name.position())?;
                Ok(())
            }

            Some(Token::OpenBracket) => {
                let variable = self.lookup_variable(b, name.val(), name.position())?;
                if variable.typ.pointer == 0 {
                    return Err(statement(
                        format!("Variable \"{}\" cannot be indexed", name.val()),
                        name.position(),
                    ));
                }

                let element = variable.typ.dereference();
                self.next()?;
                let index = self.parse_index(b)?;
                self.expect(Token::CloseBracket)?;
                self.expect(Token::Assign)?;

                self.parse_assignment_tail(
                    b,
                    name.val().clone(),
                    element,
                    Some(index),
                    name.position(),
                )
            }

            Some(Token::Assign) => {
                let variable = self.lookup_variable(b, name.val(), name.position())?;
                if variable.exp_type == ExpressionType::Constant {
                    return Err(statement(
                        format!("Cannot assign to constant \"{}\"", name.val()),
                        name.position(),
                    ));
                }
                if variable.size > 0 {
                    return Err(statement(
                        format!("Array \"{}\" requires indexed access", name.val()),
                        name.position(),
                    ));
                }

                let typ = variable.typ;
                self.next()?;
                self.parse_assignment_tail(b, name.val().clone(), typ, None, name.position())
            }

            _ => {
                let position = self.position;
                Err(syntax("Expected assignment or call", position))
            }
        }
    }

    /// Expresión de índice, materializada a constante o variable simple.
    fn parse_index(&mut self, b: &mut Builder) -> Compile<OperandIndex> {
        let position = self.position;
        let exp = self.parse_expr(b)?;
        let op = self.prepare_value(b, exp, position)?;

        let is_integer = op.typ.pointer == 0
            && matches!(
                op.typ.base,
                BaseType::Bool | BaseType::Uint8 | BaseType::Uint16 | BaseType::Uint32
            );
        if !is_integer {
            return Err(statement("Array index must be an integer value", position));
        }

        Ok(OperandIndex {
            value: op.value,
            typ: op.typ,
            exp_type: op.exp_type,
        })
    }

    /// Valor dentro de un contexto de asignación: expresión común, o
    /// las formas `cast<T>(e)` y `alloc<T>(n)` que solo existen aquí.
    /// La toma de dirección `&id` se admite únicamente como lado
    /// derecho directo de una asignación.
    fn parse_scoped_value(
        &mut self,
        b: &mut Builder,
        position: Position,
        allow_reference: bool,
    ) -> Compile<Operand> {
        match self.peek()? {
            Some(Token::Keyword(Keyword::Cast)) => {
                self.next()?;
                self.expect(Token::Less)?;
                let target = self.parse_type()?;
                self.expect(Token::Greater)?;
                self.expect(Token::OpenParen)?;
                let exp = self.parse_expr(b)?;
                self.expect(Token::CloseParen)?;

                let mut op = self.prepare_value(b, exp, position)?;
                if !can_explicit_cast(target, op.typ) {
                    return Err(statement(
                        format!("Cannot cast \"{}\" value to \"{}\"", op.typ, target),
                        position,
                    ));
                }

                op.typ = target;
                Ok(op)
            }

            Some(Token::Keyword(Keyword::Alloc)) => {
                self.next()?;
                self.expect(Token::Less)?;
                let element = self.parse_type()?;
                self.expect(Token::Greater)?;
                self.expect(Token::OpenParen)?;
                let count = self.parse_expr(b)?;
                self.expect(Token::CloseParen)?;

                self.parse_alloc(b, element, count, position)
            }

            Some(Token::Ampersand) if allow_reference => {
                self.next()?;
                let name = self.expect_id()?;
                let variable = self.lookup_variable(b, name.val(), name.position())?;
                Ok(Operand::variable(name.val().clone(), variable.typ.reference()))
            }

            _ => {
                let exp = self.parse_expr(b)?;
                self.prepare_value(b, exp, position)
            }
        }
    }

    /// Lado derecho de una asignación.
    fn parse_assignment_tail(
        &mut self,
        b: &mut Builder,
        dst: String,
        dst_type: SymbolType,
        dst_index: Option<OperandIndex>,
        position: Position,
    ) -> Compile<()> {
        b.increase_scope(ScopeType::Assign);
        let op = self.parse_scoped_value(b, position, true)?;
        b.reset_scope(ScopeType::Assign);

        if !can_implicit_cast(dst_type, op.typ, op.exp_type) {
            return Err(statement(
                format!(
                    "Cannot assign \"{}\" value to \"{}\" variable \"{}\"",
                    op.typ, dst_type, dst
                ),
                position,
            ));
        }

        b.emit(Instruction::Assign {
            op: AssignOp::None,
            dst,
            dst_index,
            op1: op,
            op2: None,
        });

        Ok(())
    }

    /// `alloc<T>(n)`: convierte la cantidad de elementos a bytes y
    /// llama a la rutina compartida de asignación de memoria.
    fn parse_alloc(
        &mut self,
        b: &mut Builder,
        element: SymbolType,
        count: Exp,
        position: Position,
    ) -> Compile<Operand> {
        check_storage_type(element, position)?;

        let element_size = size_of(element);
        let count = self.prepare_value(b, count, position)?;

        let is_integer = count.typ.pointer == 0
            && matches!(
                count.typ.base,
                BaseType::Uint8 | BaseType::Uint16 | BaseType::Uint32
            );
        if !is_integer {
            return Err(statement(
                "Allocation count must be an integer value",
                position,
            ));
        }

        let bytes = if count.exp_type == ExpressionType::Constant {
            let total = (count.constant_value() as u32 as u64) * element_size as u64;
            Operand::constant(total.to_string(), UINT32)
        } else {
            let temp = b.unused_variable(UINT32, position)?;
            b.emit(Instruction::Assign {
                op: AssignOp::Multiply,
                dst: temp.clone(),
                dst_index: None,
                op1: count,
                op2: Some(Operand::constant(element_size.to_string(), UINT32)),
            });
            Operand::variable(temp, UINT32)
        };

        b.prepare_for_call("#Alloc", &[bytes], position)?;

        // El resultado de la rutina se tipa con el puntero pedido
        let result_type = element.reference();
        let temp = b.unused_variable(result_type, position)?;
        b.emit(Instruction::Call {
            target: "#Alloc".to_string(),
            return_symbol: Some(temp.clone()),
        });

        Ok(Operand::variable(temp, result_type))
    }

    fn parse_if(&mut self, b: &mut Builder) -> Compile<()> {
        self.next()?;
        self.expect(Token::OpenParen)?;
        let condition = self.parse_expr(b)?;
        self.expect(Token::CloseParen)?;

        let condition = self.to_condition(b, condition)?;

        b.backpatch(&condition.true_list, b.next_ip())?;
        self.parse_statement(b)?;

        if self.eat(&Token::Keyword(Keyword::Else))? {
            let exit = b.emit_with_backpatch(Instruction::Goto { target: -1 });
            b.backpatch(&condition.false_list, b.next_ip())?;
            self.parse_statement(b)?;
            b.backpatch(&exit, b.next_ip())?;
        } else {
            b.backpatch(&condition.false_list, b.next_ip())?;
        }

        Ok(())
    }

    fn parse_while(&mut self, b: &mut Builder) -> Compile<()> {
        self.next()?;
        let begin = b.next_ip();

        self.expect(Token::OpenParen)?;
        let condition = self.parse_expr(b)?;
        self.expect(Token::CloseParen)?;
        let condition = self.to_condition(b, condition)?;

        b.backpatch(&condition.true_list, b.next_ip())?;

        b.increase_scope(ScopeType::Break);
        b.increase_scope(ScopeType::Continue);
        self.parse_statement(b)?;

        b.emit(Instruction::Goto { target: begin });
        b.backpatch(&condition.false_list, b.next_ip())?;

        b.backpatch_scope(ScopeType::Break, b.next_ip())?;
        b.backpatch_scope(ScopeType::Continue, begin)?;
        Ok(())
    }

    fn parse_do_while(&mut self, b: &mut Builder) -> Compile<()> {
        self.next()?;
        let begin = b.next_ip();

        b.increase_scope(ScopeType::Break);
        b.increase_scope(ScopeType::Continue);
        self.parse_statement(b)?;

        self.expect(Token::Keyword(Keyword::While))?;
        self.expect(Token::OpenParen)?;
        let condition_ip = b.next_ip();
        let condition = self.parse_expr(b)?;
        self.expect(Token::CloseParen)?;
        self.expect(Token::Semicolon)?;

        let condition = self.to_condition(b, condition)?;
        b.backpatch(&condition.true_list, begin)?;
        b.backpatch(&condition.false_list, b.next_ip())?;

        b.backpatch_scope(ScopeType::Continue, condition_ip)?;
        b.backpatch_scope(ScopeType::Break, b.next_ip())?;
        Ok(())
    }

    fn parse_for(&mut self, b: &mut Builder) -> Compile<()> {
        self.next()?;
        self.expect(Token::OpenParen)?;

        // Inicialización
        if !self.eat(&Token::Semicolon)? {
            if self.peek_is_type()? {
                self.parse_local_declaration(b)?;
            } else {
                self.parse_simple_statement(b)?;
                self.expect(Token::Semicolon)?;
            }
        }

        // Condición
        let condition_ip = b.next_ip();
        let condition = if self.peek()? != Some(&Token::Semicolon) {
            let exp = self.parse_expr(b)?;
            Some(self.to_condition(b, exp)?)
        } else {
            None
        };
        self.expect(Token::Semicolon)?;

        // Sin condición, el cuerpo se alcanza saltando sobre el paso
        let skip_step = if condition.is_none() {
            Some(b.emit_with_backpatch(Instruction::Goto { target: -1 }))
        } else {
            None
        };

        // Paso, emitido antes del cuerpo
        let step_ip = b.next_ip();
        if self.peek()? != Some(&Token::CloseParen) {
            self.parse_simple_statement(b)?;
        }
        if condition.is_some() {
            b.emit(Instruction::Goto {
                target: condition_ip,
            });
        }
        self.expect(Token::CloseParen)?;

        let body_ip = b.next_ip();
        if let Some(condition) = &condition {
            b.backpatch(&condition.true_list, body_ip)?;
        }
        if let Some(skip_step) = &skip_step {
            b.backpatch(skip_step, body_ip)?;
        }

        b.increase_scope(ScopeType::Break);
        b.increase_scope(ScopeType::Continue);
        self.parse_statement(b)?;

        b.emit(Instruction::Goto { target: step_ip });

        if let Some(condition) = &condition {
            b.backpatch(&condition.false_list, b.next_ip())?;
        }
        b.backpatch_scope(ScopeType::Break, b.next_ip())?;
        b.backpatch_scope(ScopeType::Continue, step_ip)?;
        Ok(())
    }

    fn parse_switch(&mut self, b: &mut Builder) -> Compile<()> {
        let position = self.next()?.unwrap().position();
        self.expect(Token::OpenParen)?;
        let selector = self.parse_expr(b)?;
        self.expect(Token::CloseParen)?;

        if selector.has_lists() {
            return Err(statement(
                "Switch selector cannot be a condition",
                position,
            ));
        }
        let selector = self.prepare_value(b, selector, position)?;

        // El selector se copia a un temporal para que las
        // comparaciones emitidas después del cuerpo vean el valor
        // original aunque el cuerpo lo modifique
        let selector = if selector.exp_type == ExpressionType::Variable {
            let temp = b.unused_variable(selector.typ, position)?;
            b.emit(Instruction::Assign {
                op: AssignOp::None,
                dst: temp.clone(),
                dst_index: None,
                op1: selector.clone(),
                op2: None,
            });
            Operand::variable(temp, selector.typ)
        } else {
            selector
        };

        self.expect(Token::OpenCurly)?;

        // El despacho se emite después del cuerpo; este salto lo alcanza
        let dispatch = b.emit_with_backpatch(Instruction::Goto { target: -1 });

        b.increase_scope(ScopeType::Break);

        let mut cases: Vec<(String, SymbolType, i32)> = Vec::new();
        let mut default_ip: Option<i32> = None;

        while !self.eat(&Token::CloseCurly)? {
            match self.peek()? {
                Some(Token::Keyword(Keyword::Case)) => {
                    let case_position = self.next()?.unwrap().position();
                    let constant = self.parse_case_value(case_position)?;
                    self.expect(Token::Colon)?;

                    if !can_implicit_cast(selector.typ, constant.typ, ExpressionType::Constant) {
                        return Err(statement(
                            "Case value type does not match switch selector",
                            case_position,
                        ));
                    }
                    if cases.iter().any(|(value, _, _)| *value == constant.value) {
                        return Err(statement("Duplicate case value", case_position));
                    }

                    cases.push((constant.value, constant.typ, b.next_ip()));
                }

                Some(Token::Keyword(Keyword::Default)) => {
                    let default_position = self.next()?.unwrap().position();
                    self.expect(Token::Colon)?;

                    if default_ip.is_some() {
                        return Err(statement("Duplicate default case", default_position));
                    }
                    default_ip = Some(b.next_ip());
                }

                Some(_) => self.parse_statement(b)?,
                None => {
                    return Err(syntax("Unexpected end of input in switch", self.position))
                }
            }
        }

        // La caída del último caso sale del switch
        let fall_out = b.emit_with_backpatch(Instruction::Goto { target: -1 });

        // Cadena de comparaciones del despacho
        b.backpatch(&dispatch, b.next_ip())?;
        for (value, _, case_ip) in &cases {
            b.emit(Instruction::If {
                op: CompareOp::Equal,
                op1: selector.clone(),
                op2: Operand::constant(value.clone(), selector.typ),
                target: *case_ip,
            });
        }
        if let Some(default_ip) = default_ip {
            b.emit(Instruction::Goto { target: default_ip });
        }

        b.backpatch(&fall_out, b.next_ip())?;
        b.backpatch_scope(ScopeType::Break, b.next_ip())?;
        Ok(())
    }

    /// Valor constante literal: entero, de carácter, de cadena, de
    /// puntero nulo o booleano.
    fn parse_case_value(&mut self, position: Position) -> Compile<Operand> {
        match self.next()?.map(Located::split) {
            Some((_, Token::IntLiteral(value))) => Ok(Operand::constant(
                value.to_string(),
                smallest_type_for(value),
            )),
            Some((_, Token::CharLiteral { value, size })) => {
                Ok(Operand::constant(value.to_string(), char_type(size)))
            }
            Some((_, Token::StringLiteral(value))) => Ok(Operand::constant(value, STRING)),
            Some((_, Token::Keyword(Keyword::True))) => Ok(Operand::constant("1", BOOL)),
            Some((_, Token::Keyword(Keyword::False))) => Ok(Operand::constant("0", BOOL)),
            Some((_, Token::Keyword(Keyword::Null))) => Ok(Operand::constant("0", VOID_PTR)),
            _ => Err(syntax("Expected constant value", position)),
        }
    }

    fn parse_return(&mut self, b: &mut Builder) -> Compile<()> {
        let position = self.next()?.unwrap().position();

        if self.eat(&Token::Semicolon)? {
            b.emit(Instruction::Return { operand: None });
            return Ok(());
        }

        b.increase_scope(ScopeType::Assign);
        let op = self.parse_scoped_value(b, position, false)?;
        b.reset_scope(ScopeType::Assign);

        self.expect(Token::Semicolon)?;
        b.emit(Instruction::Return { operand: Some(op) });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expresiones

    fn parse_expr(&mut self, b: &mut Builder) -> Compile<Exp> {
        self.parse_log_or(b)
    }

    fn parse_log_or(&mut self, b: &mut Builder) -> Compile<Exp> {
        let mut lhs = self.parse_log_and(b)?;

        while self.eat(&Token::LogOr)? {
            let position = self.position;
            let left = self.to_condition(b, lhs)?;

            let marker = b.next_ip();
            let rhs = self.parse_log_and(b)?;
            let right = self.to_condition(b, rhs)?;

            // Si el lado izquierdo es falso se evalúa el derecho
            b.backpatch(&left.false_list, marker)?;

            let temp = left.temp.or(right.temp);
            lhs = Exp {
                op: condition_operand(&temp, position),
                true_list: merge_lists(left.true_list, right.true_list),
                false_list: right.false_list,
                temp,
            };
        }

        Ok(lhs)
    }

    fn parse_log_and(&mut self, b: &mut Builder) -> Compile<Exp> {
        let mut lhs = self.parse_cmp(b)?;

        while self.eat(&Token::LogAnd)? {
            let position = self.position;
            let left = self.to_condition(b, lhs)?;

            let marker = b.next_ip();
            let rhs = self.parse_cmp(b)?;
            let right = self.to_condition(b, rhs)?;

            // Si el lado izquierdo es verdadero se evalúa el derecho
            b.backpatch(&left.true_list, marker)?;

            let temp = left.temp.or(right.temp);
            lhs = Exp {
                op: condition_operand(&temp, position),
                true_list: right.true_list,
                false_list: merge_lists(left.false_list, right.false_list),
                temp,
            };
        }

        Ok(lhs)
    }

    fn parse_cmp(&mut self, b: &mut Builder) -> Compile<Exp> {
        let lhs = self.parse_shift(b)?;

        let op = match self.peek()? {
            Some(Token::Equal) => CompareOp::Equal,
            Some(Token::NotEqual) => CompareOp::NotEqual,
            Some(Token::Greater) => CompareOp::Greater,
            Some(Token::Less) => CompareOp::Less,
            Some(Token::GreaterOrEqual) => CompareOp::GreaterOrEqual,
            Some(Token::LessOrEqual) => CompareOp::LessOrEqual,
            _ => return Ok(lhs),
        };
        let position = self.next()?.unwrap().position();

        let op1 = self.prepare_value(b, lhs, position)?;
        let rhs = self.parse_shift(b)?;
        let op2 = self.prepare_value(b, rhs, position)?;

        let strings = op1.typ.base == BaseType::String || op2.typ.base == BaseType::String;
        if strings {
            if op1.typ != STRING || op2.typ != STRING {
                return Err(statement("Strings can only be compared to strings", position));
            }
            if !matches!(op, CompareOp::Equal | CompareOp::NotEqual) {
                return Err(statement(
                    "Strings support only equality comparison",
                    position,
                ));
            }
        } else {
            check_scalar(&op1, position)?;
            check_scalar(&op2, position)?;
        }

        self.make_condition(b, op, op1, op2, position)
    }

    /// Crea la condición de una comparación: en contexto de asignación
    /// se preasigna un temporal booleano en 0, luego se emite el salto
    /// condicional (lista verdadera) y el incondicional (lista falsa).
    fn make_condition(
        &mut self,
        b: &mut Builder,
        op: CompareOp,
        op1: Operand,
        op2: Operand,
        position: Position,
    ) -> Compile<Exp> {
        let temp = if b.is_scope_active(ScopeType::Assign) {
            let temp = b.unused_variable(BOOL, position)?;
            b.emit(Instruction::Assign {
                op: AssignOp::None,
                dst: temp.clone(),
                dst_index: None,
                op1: Operand::constant("0", BOOL),
                op2: None,
            });
            Some(temp)
        } else {
            None
        };

        let true_list = b.emit_with_backpatch(Instruction::If {
            op,
            op1,
            op2,
            target: -1,
        });
        let false_list = b.emit_with_backpatch(Instruction::Goto { target: -1 });

        Ok(Exp {
            op: condition_operand(&temp, position),
            true_list,
            false_list,
            temp,
        })
    }

    /// Convierte una expresión en condición: si ya tiene listas se
    /// entrega tal cual; un valor escalar se compara contra cero.
    fn to_condition(&mut self, b: &mut Builder, exp: Exp) -> Compile<Exp> {
        if exp.has_lists() {
            return Ok(exp);
        }

        let position = self.position;
        let op = if exp.op.index.is_some() {
            self.prepare_value(b, exp, position)?
        } else {
            exp.op
        };

        check_scalar(&op, position)?;

        let zero = Operand::constant("0", op.typ);
        self.make_condition(b, CompareOp::NotEqual, op, zero, position)
    }

    fn parse_shift(&mut self, b: &mut Builder) -> Compile<Exp> {
        let mut lhs = self.parse_add(b)?;

        loop {
            let op = match self.peek()? {
                Some(Token::ShiftLeft) => AssignOp::ShiftLeft,
                Some(Token::ShiftRight) => AssignOp::ShiftRight,
                _ => return Ok(lhs),
            };
            self.next()?;
            let position = self.position;

            let rhs = self.parse_add(b)?;
            lhs = self.emit_binary(b, op, lhs, rhs, position)?;
        }
    }

    fn parse_add(&mut self, b: &mut Builder) -> Compile<Exp> {
        let mut lhs = self.parse_mul(b)?;

        loop {
            let op = match self.peek()? {
                Some(Token::Plus) => AssignOp::Add,
                Some(Token::Minus) => AssignOp::Subtract,
                _ => return Ok(lhs),
            };
            self.next()?;
            let position = self.position;

            let rhs = self.parse_mul(b)?;
            lhs = self.emit_binary(b, op, lhs, rhs, position)?;
        }
    }

    fn parse_mul(&mut self, b: &mut Builder) -> Compile<Exp> {
        let mut lhs = self.parse_unary(b)?;

        loop {
            let op = match self.peek()? {
                Some(Token::Star) => AssignOp::Multiply,
                Some(Token::Slash) => AssignOp::Divide,
                Some(Token::Percent) => AssignOp::Remainder,
                _ => return Ok(lhs),
            };
            self.next()?;
            let position = self.position;

            let rhs = self.parse_unary(b)?;
            lhs = self.emit_binary(b, op, lhs, rhs, position)?;
        }
    }

    /// Operación aritmética binaria sobre un temporal del tipo más
    /// ancho de ambos operandos.
    fn emit_binary(
        &mut self,
        b: &mut Builder,
        op: AssignOp,
        lhs: Exp,
        rhs: Exp,
        position: Position,
    ) -> Compile<Exp> {
        let op1 = self.prepare_value(b, lhs, position)?;
        let op2 = self.prepare_value(b, rhs, position)?;

        // Concatenación de literales de cadena
        if op == AssignOp::Add
            && op1.typ.base == BaseType::String
            && op2.typ.base == BaseType::String
        {
            if op1.exp_type != ExpressionType::Constant || op2.exp_type != ExpressionType::Constant
            {
                return Err(statement(
                    "String concatenation requires constant operands",
                    position,
                ));
            }

            let temp = b.unused_variable(STRING, position)?;
            b.emit(Instruction::Assign {
                op: AssignOp::Add,
                dst: temp.clone(),
                dst_index: None,
                op1,
                op2: Some(op2),
            });
            return Ok(Exp::value(Operand::variable(temp, STRING)));
        }

        let multiplicative = matches!(
            op,
            AssignOp::Multiply
                | AssignOp::Divide
                | AssignOp::Remainder
                | AssignOp::ShiftLeft
                | AssignOp::ShiftRight
        );
        if multiplicative && (op1.typ.pointer != 0 || op2.typ.pointer != 0) {
            return Err(statement(
                "Pointers are not allowed in this arithmetic operation",
                position,
            ));
        }

        let result_type = largest_arithmetic_type(op1.typ, op2.typ);
        if result_type.base == BaseType::Unknown {
            return Err(statement(
                "Operand types are not compatible with arithmetic",
                position,
            ));
        }

        let temp = b.unused_variable(result_type, position)?;
        b.emit(Instruction::Assign {
            op,
            dst: temp.clone(),
            dst_index: None,
            op1,
            op2: Some(op2),
        });

        Ok(Exp::value(Operand::variable(temp, result_type)))
    }

    fn parse_unary(&mut self, b: &mut Builder) -> Compile<Exp> {
        if self.eat(&Token::Minus)? {
            let position = self.position;
            let exp = self.parse_unary(b)?;
            let op = self.prepare_value(b, exp, position)?;
            check_scalar(&op, position)?;
            if op.typ.pointer != 0 {
                return Err(statement("Pointers cannot be negated", position));
            }

            let temp = b.unused_variable(op.typ, position)?;
            b.emit(Instruction::Assign {
                op: AssignOp::Negation,
                dst: temp.clone(),
                dst_index: None,
                op1: op.clone(),
                op2: None,
            });

            return Ok(Exp::value(Operand::variable(temp, op.typ)));
        }

        self.parse_primary(b)
    }

    fn parse_primary(&mut self, b: &mut Builder) -> Compile<Exp> {
        let token = match self.next()? {
            Some(token) => token,
            None => {
                return Err(syntax("Expected expression, found end of input", self.position))
            }
        };
        let (position, token) = token.split();

        let exp = match token {
            Token::IntLiteral(value) => Exp::value(Operand::constant(
                value.to_string(),
                smallest_type_for(value),
            )),

            Token::CharLiteral { value, size } => {
                Exp::value(Operand::constant(value.to_string(), char_type(size)))
            }

            Token::StringLiteral(value) => Exp::value(Operand::constant(value, STRING)),

            Token::Keyword(Keyword::True) => Exp::value(Operand::constant("1", BOOL)),
            Token::Keyword(Keyword::False) => Exp::value(Operand::constant("0", BOOL)),
            Token::Keyword(Keyword::Null) => Exp::value(Operand::constant("0", VOID_PTR)),

            Token::OpenParen => {
                let exp = self.parse_expr(b)?;
                self.expect(Token::CloseParen)?;
                exp
            }

            Token::Id(name) => match self.peek()? {
                Some(Token::OpenParen) => {
                    self.next()?;
                    self.parse_call(b, name, position)?
                }

                Some(Token::OpenBracket) => {
                    let variable = self.lookup_variable(b, &name, position)?;
                    if variable.typ.pointer == 0 {
                        return Err(statement(
                            format!("Variable \"{}\" cannot be indexed", name),
                            position,
                        ));
                    }

                    let element = variable.typ.dereference();
                    self.next()?;
                    let index = self.parse_index(b)?;
                    self.expect(Token::CloseBracket)?;

                    Exp::value(Operand {
                        value: name,
                        typ: element,
                        exp_type: ExpressionType::Variable,
                        index: Some(index),
                    })
                }

                _ => {
                    let variable = self.lookup_variable(b, &name, position)?;

                    if let Some(constant) = &variable.const_value {
                        Exp::value(Operand::constant(constant.clone(), variable.typ))
                    } else {
                        Exp::value(Operand::variable(name, variable.typ))
                    }
                }
            },

            token => {
                return Err(syntax(
                    format!("Expected expression, found {:?}", token),
                    position,
                ))
            }
        };

        Ok(exp)
    }

    /// Llamada a función; el paréntesis de apertura ya fue consumido.
    fn parse_call(&mut self, b: &mut Builder, name: String, position: Position) -> Compile<Exp> {
        let mut parameters = Vec::new();

        if !self.eat(&Token::CloseParen)? {
            loop {
                b.increase_scope(ScopeType::Assign);
                let op = self.parse_scoped_value(b, position, false)?;
                b.decrease_scope(ScopeType::Assign);

                parameters.push(op);

                if self.eat(&Token::Comma)? {
                    continue;
                }
                self.expect(Token::CloseParen)?;
                break;
            }
        }

        b.prepare_for_call(&name, &parameters, position)?;
        let return_type = b
            .find_function(&name)
            .map(|symbol| symbol.return_type)
            .ok_or_else(Diagnostic::internal)?;

        let return_symbol = if return_type != crate::sym::VOID {
            Some(b.unused_variable(return_type, position)?)
        } else {
            None
        };

        b.emit(Instruction::Call {
            target: name,
            return_symbol: return_symbol.clone(),
        });

        match return_symbol {
            Some(temp) => Ok(Exp::value(Operand::variable(temp, return_type))),
            None => Ok(Exp::value(Operand {
                value: String::new(),
                typ: crate::sym::VOID,
                exp_type: ExpressionType::None,
                index: None,
            })),
        }
    }

    /// Materializa una expresión a un operando simple: resuelve las
    /// listas de corto-circuito y los accesos indexados.
    fn prepare_value(&mut self, b: &mut Builder, exp: Exp, position: Position) -> Compile<Operand> {
        let op = if exp.has_lists() {
            self.materialize(b, exp, position)?
        } else {
            exp.op
        };

        if op.index.is_some() {
            // Un operando indexado se materializa en un temporal antes
            // de participar en cualquier otra instrucción
            let temp = b.unused_variable(op.typ, position)?;
            let typ = op.typ;
            b.emit(Instruction::Assign {
                op: AssignOp::None,
                dst: temp.clone(),
                dst_index: None,
                op1: op,
                op2: None,
            });

            return Ok(Operand::variable(temp, typ));
        }

        Ok(op)
    }

    /// Resuelve las listas de una condición en un valor booleano.
    fn materialize(&mut self, b: &mut Builder, exp: Exp, position: Position) -> Compile<Operand> {
        if exp.true_list.is_empty() || exp.false_list.is_empty() {
            return Err(Diagnostic::internal());
        }

        match exp.temp {
            Some(temp) => {
                // El temporal ya fue inicializado en 0 antes de la
                // comparación; la lista verdadera apunta a la
                // instrucción que le asigna 1 y la falsa a la
                // inmediatamente posterior
                let true_ip = b.next_ip();
                b.emit(Instruction::Assign {
                    op: AssignOp::None,
                    dst: temp.clone(),
                    dst_index: None,
                    op1: Operand::constant("1", BOOL),
                    op2: None,
                });
                let false_ip = b.next_ip();

                b.backpatch(&exp.true_list, true_ip)?;
                b.backpatch(&exp.false_list, false_ip)?;

                Ok(Operand::variable(temp, BOOL))
            }
            None => {
                // Fuera de un contexto de asignación no hay temporal
                // preasignado; se construye con saltos explícitos
                let temp = b.unused_variable(BOOL, position)?;

                let true_ip = b.next_ip();
                b.emit(Instruction::Assign {
                    op: AssignOp::None,
                    dst: temp.clone(),
                    dst_index: None,
                    op1: Operand::constant("1", BOOL),
                    op2: None,
                });
                let skip = b.emit_with_backpatch(Instruction::Goto { target: -1 });

                let false_ip = b.next_ip();
                b.emit(Instruction::Assign {
                    op: AssignOp::None,
                    dst: temp.clone(),
                    dst_index: None,
                    op1: Operand::constant("0", BOOL),
                    op2: None,
                });

                b.backpatch(&exp.true_list, true_ip)?;
                b.backpatch(&exp.false_list, false_ip)?;
                b.backpatch(&skip, b.next_ip())?;

                Ok(Operand::variable(temp, BOOL))
            }
        }
    }

    fn lookup_variable<'b>(
        &self,
        b: &'b Builder,
        name: &str,
        position: Position,
    ) -> Compile<&'b crate::sym::Symbol> {
        b.find_variable(name).ok_or_else(|| {
            statement(
                format!("Variable \"{}\" was not declared", name),
                position,
            )
        })
    }
}

/// Operando que representa el valor de una condición: el temporal
/// preasignado, si existe.
fn condition_operand(temp: &Option<String>, _position: Position) -> Operand {
    match temp {
        Some(temp) => Operand::variable(temp.clone(), BOOL),
        None => Operand {
            value: String::new(),
            typ: BOOL,
            exp_type: ExpressionType::None,
            index: None,
        },
    }
}

fn char_type(size: u8) -> SymbolType {
    match size {
        1 => sym::UINT8,
        2 => sym::UINT16,
        _ => UINT32,
    }
}

/// Verifica que un tipo pueda declararse como almacenamiento.
fn check_storage_type(typ: SymbolType, position: Position) -> Compile<()> {
    if typ.is_valid() {
        Ok(())
    } else {
        Err(statement("Specified type is not allowed", position))
    }
}

/// Verifica que un operando sea escalar (entero, booleano o puntero).
fn check_scalar(op: &Operand, position: Position) -> Compile<()> {
    let scalar = op.typ.pointer > 0
        || matches!(
            op.typ.base,
            BaseType::Bool | BaseType::Uint8 | BaseType::Uint16 | BaseType::Uint32
        );

    if scalar {
        Ok(())
    } else {
        Err(statement(
            "Specified type is not allowed in this context",
            position,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(source: &str) -> Program {
        parse(Lexer::new(source, ".")).expect("parse")
    }

    #[test]
    fn stream_opens_with_jump_to_entry_point() {
        let program = program("uint8 Main() { return 0; }");

        // La primera función emitida queda anclada después del salto
        assert!(matches!(program.stream[0], Instruction::Goto { target: 1 }));
        assert!(matches!(program.stream[1], Instruction::Return { .. }));

        let main = program
            .symbols
            .iter()
            .find(|s| s.name == ENTRY_POINT_NAME)
            .unwrap();
        assert_eq!(main.ip, 1);
        assert_eq!(main.ref_count, 1);
    }

    #[test]
    fn if_lowering_uses_true_and_false_lists() {
        let program = program(
            "uint8 Main() { uint8 x = 3; if (x > 2) { x = 1; } return x; }",
        );

        // [2] If x>2 -> 4, [3] Goto -> 5, [4] cuerpo, [5] return
        assert!(matches!(
            program.stream[2],
            Instruction::If {
                op: CompareOp::Greater,
                target: 4,
                ..
            }
        ));
        assert!(matches!(program.stream[3], Instruction::Goto { target: 5 }));
        assert!(matches!(program.stream[4], Instruction::Assign { .. }));
        assert!(matches!(program.stream[5], Instruction::Return { .. }));
    }

    #[test]
    fn while_with_break_resolves_scopes() {
        let program = program(
            "uint8 Main() {\n\
             \tuint8 i = 0;\n\
             \twhile (true) {\n\
             \t\tif (i >= 3) break;\n\
             \t\ti = i + 1;\n\
             \t}\n\
             \treturn i;\n\
             }",
        );

        // Condición del ciclo en 2-3, cuerpo en 4.., salto de regreso
        // en 9 y salida en 10
        assert!(matches!(program.stream[2], Instruction::If { target: 4, .. }));
        assert!(matches!(program.stream[3], Instruction::Goto { target: 10 }));
        assert!(matches!(program.stream[4], Instruction::If { target: 6, .. }));
        assert!(matches!(program.stream[5], Instruction::Goto { target: 7 }));
        assert!(matches!(program.stream[6], Instruction::Goto { target: 10 }));
        assert!(matches!(program.stream[9], Instruction::Goto { target: 2 }));
        assert!(matches!(program.stream[10], Instruction::Return { .. }));
    }

    #[test]
    fn short_circuit_assignment_materializes_boolean_temp() {
        let program = program(
            "uint8 Main() { uint8 a = 1; bool c = a < 2 && a > 0; return 0; }",
        );

        // El temporal se inicializa en 0 antes de la comparación
        match &program.stream[2] {
            Instruction::Assign { dst, op1, .. } => {
                assert_eq!(dst, "#b_1");
                assert_eq!(op1.value, "0");
            }
            other => panic!("expected temp init, found {:?}", other),
        }

        // Lista verdadera hacia la asignación de 1, falsa justo después
        assert!(matches!(program.stream[3], Instruction::If { target: 5, .. }));
        assert!(matches!(program.stream[4], Instruction::Goto { target: 9 }));
        assert!(matches!(program.stream[6], Instruction::If { target: 8, .. }));
        assert!(matches!(program.stream[7], Instruction::Goto { target: 9 }));

        match &program.stream[8] {
            Instruction::Assign { dst, op1, .. } => {
                assert_eq!(dst, "#b_1");
                assert_eq!(op1.value, "1");
            }
            other => panic!("expected true assignment, found {:?}", other),
        }

        match &program.stream[9] {
            Instruction::Assign { dst, op1, .. } => {
                assert_eq!(dst, "c");
                assert_eq!(op1.value, "#b_1");
            }
            other => panic!("expected final copy, found {:?}", other),
        }
    }

    #[test]
    fn goto_produces_label_references() {
        let program = program(
            "uint8 Main() { goto End; PrintString(\"X\"); End: return 0; }",
        );

        assert!(program
            .stream
            .iter()
            .any(|i| matches!(i, Instruction::GotoLabel { label } if label == "End")));

        let label = program
            .symbols
            .iter()
            .find(|s| s.name == "End")
            .expect("label symbol");
        assert!(matches!(
            program.stream[label.ip as usize],
            Instruction::Return { .. }
        ));
    }

    #[test]
    fn call_pushes_precede_the_call() {
        let program = program("uint8 Main() { PrintUint32(7); return 0; }");

        let call = program
            .stream
            .iter()
            .position(|i| matches!(i, Instruction::Call { target, .. } if target == "PrintUint32"))
            .expect("call");
        assert!(matches!(
            program.stream[call - 1],
            Instruction::Push { .. }
        ));
    }

    #[test]
    fn duplicate_declaration_is_rejected() {
        let error = parse(Lexer::new(
            "uint8 Main() { uint8 x; uint8 x; return 0; }",
            ".",
        ))
        .unwrap_err();
        assert!(error.message.contains("already declared"));
    }

    #[test]
    fn constants_are_resolved_at_parse_time() {
        let program = program(
            "uint8 Main() { const uint8 limit = 10; uint8 x = limit; return 0; }",
        );

        // La referencia a la constante llega como operando constante
        let assign = program
            .stream
            .iter()
            .find_map(|i| match i {
                Instruction::Assign { dst, op1, .. } if dst == "x" => Some(op1),
                _ => None,
            })
            .expect("assignment to x");
        assert_eq!(assign.exp_type, ExpressionType::Constant);
        assert_eq!(assign.value, "10");
    }
}
