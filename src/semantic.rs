//! Construcción semántica del programa.
//!
//! El [`Builder`] es la fachada que el parser invoca en orden de
//! aparición del código fuente. Mantiene la tabla de símbolos, la cola
//! de declaraciones de la función en curso, los contadores de
//! variables temporales y las pilas de ámbitos para `break`,
//! `continue` y asignaciones; y hace crecer el flujo de instrucciones
//! con sus listas de backpatch.
//!
//! Al terminar el análisis, [`Builder::postprocess`] recorre el grafo
//! de llamadas desde el punto de entrada y marca las funciones
//! alcanzables; el emisor descarta las que queden sin referencias.

use crate::error::{compilation, declaration, statement, Compile, Diagnostic};
use crate::ir::{BackpatchList, Instruction, Operand};
use crate::source::Position;
use crate::sym::{
    BaseType, ExpressionType, Symbol, SymbolTable, SymbolType, UINT8, UNKNOWN,
};

/// Nombre de la función que representa el punto de entrada.
pub const ENTRY_POINT_NAME: &str = "Main";

/// Ámbitos controlados por el builder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScopeType {
    Assign,
    Break,
    Continue,
}

/// Resultado final de la fase de análisis.
#[derive(Debug)]
pub struct Program {
    pub stream: Vec<Instruction>,
    pub symbols: SymbolTable,
    pub stack_size: u32,
}

/// Estado de construcción del programa durante el análisis.
pub struct Builder {
    stream: Vec<Instruction>,
    symbols: SymbolTable,

    /// Declaraciones de la función en curso, aún sin padre.
    declarations: Vec<Symbol>,
    parameter_count: u16,

    var_count_bool: u32,
    var_count_uint8: u32,
    var_count_uint16: u32,
    var_count_uint32: u32,
    var_count_string: u32,

    break_list: Vec<BackpatchList>,
    continue_list: Vec<BackpatchList>,
    assign_scope: i32,

    function_ip: i32,
}

impl Builder {
    pub fn new() -> Self {
        let mut builder = Builder {
            stream: Vec::new(),
            symbols: SymbolTable::default(),
            declarations: Vec::new(),
            parameter_count: 0,
            var_count_bool: 0,
            var_count_uint8: 0,
            var_count_uint16: 0,
            var_count_uint32: 0,
            var_count_string: 0,
            break_list: Vec::new(),
            continue_list: Vec::new(),
            assign_scope: 0,
            function_ip: 0,
        };

        builder.declare_shared_functions();

        // La instrucción 0 queda reservada para el salto inicial al
        // punto de entrada; el postprocesador le asigna su destino.
        builder.emit(Instruction::Goto { target: -1 });

        builder
    }

    /// Siguiente IP abstracto.
    pub fn next_ip(&self) -> i32 {
        self.stream.len() as i32
    }

    /// Agrega una instrucción al flujo y retorna su índice.
    pub fn emit(&mut self, instruction: Instruction) -> usize {
        self.stream.push(instruction);
        self.stream.len() - 1
    }

    /// Agrega una instrucción y la envuelve en una lista de backpatch
    /// pendiente de destino.
    pub fn emit_with_backpatch(&mut self, instruction: Instruction) -> BackpatchList {
        vec![self.emit(instruction)]
    }

    /// Asigna el IP de destino a cada instrucción de la lista.
    pub fn backpatch(&mut self, list: &BackpatchList, new_ip: i32) -> Compile<()> {
        for &index in list {
            match &mut self.stream[index] {
                Instruction::Goto { target } => *target = new_ip,
                Instruction::If { target, .. } => *target = new_ip,
                _ => return Err(Diagnostic::internal()),
            }
        }

        Ok(())
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    fn add_symbol(
        &mut self,
        name: &str,
        typ: SymbolType,
        size: i32,
        return_type: SymbolType,
        exp_type: ExpressionType,
        ip: i32,
        parameter: i32,
        parent: Option<&str>,
        is_temp: bool,
        position: Position,
    ) -> Compile<usize> {
        if name.is_empty() {
            return Err(declaration("Symbol name must not be empty", position));
        }

        let mut symbol = Symbol::new(name, typ);
        symbol.size = size;
        symbol.return_type = return_type;
        symbol.exp_type = exp_type;
        symbol.ip = ip;
        symbol.parameter = parameter;
        symbol.parent = parent.map(str::to_string);
        symbol.is_temp = is_temp;

        Ok(self.symbols.push(symbol))
    }

    /// Agrega una declaración a la cola de la función en curso.
    pub fn to_declaration(
        &mut self,
        typ: SymbolType,
        size: i32,
        name: &str,
        exp_type: ExpressionType,
        position: Position,
    ) -> Compile<()> {
        if self.declarations.iter().any(|d| d.name == name) {
            return Err(declaration(
                format!("Variable \"{}\" is already declared in this scope", name),
                position,
            ));
        }

        let mut symbol = Symbol::new(name, typ);
        symbol.size = size;
        symbol.exp_type = exp_type;
        self.declarations.push(symbol);
        Ok(())
    }

    /// Registra el valor resuelto de una declaración `const`.
    pub fn set_declaration_constant(&mut self, name: &str, value: String) {
        if let Some(symbol) = self.declarations.iter_mut().find(|d| d.name == name) {
            symbol.const_value = Some(value);
            symbol.exp_type = ExpressionType::Constant;
        }
    }

    /// Agrega un parámetro formal a la cola de la función en curso.
    pub fn to_parameter(&mut self, typ: SymbolType, name: &str, position: Position) -> Compile<()> {
        if self.declarations.iter().any(|d| d.name == name) {
            return Err(declaration(
                format!("Parameter \"{}\" is already declared in this scope", name),
                position,
            ));
        }

        self.parameter_count += 1;

        let mut symbol = Symbol::new(name, typ);
        symbol.parameter = self.parameter_count as i32;
        self.declarations.push(symbol);
        Ok(())
    }

    /// Agrega una etiqueta local a la cola de la función en curso.
    pub fn add_label(&mut self, name: &str, ip: i32, position: Position) -> Compile<()> {
        if self.declarations.iter().any(|d| d.name == name) {
            return Err(declaration(
                format!("Label \"{}\" is already declared in this scope", name),
                position,
            ));
        }

        let mut symbol = Symbol::new(name, SymbolType::of(BaseType::Label));
        symbol.ip = ip;
        self.declarations.push(symbol);
        Ok(())
    }

    /// Declara una variable estática en la tabla principal.
    pub fn add_static_variable(
        &mut self,
        typ: SymbolType,
        size: i32,
        name: &str,
        position: Position,
    ) -> Compile<()> {
        if self.symbols.find_global(name).is_some() || self.symbols.find_callable(name).is_some() {
            return Err(declaration(
                format!("Variable \"{}\" is already declared in this scope", name),
                position,
            ));
        }

        self.add_symbol(
            name,
            typ,
            size,
            UNKNOWN,
            ExpressionType::Variable,
            0,
            0,
            None,
            false,
            position,
        )?;

        Ok(())
    }

    /// Registra el valor resuelto de una estática `const`.
    pub fn set_static_constant(&mut self, name: &str, value: String) {
        if let Some(index) = self.symbols.find_global(name) {
            let symbol = self.symbols.get_mut(index);
            symbol.const_value = Some(value);
            symbol.exp_type = ExpressionType::Constant;
        }
    }

    /// Cierra la definición de una función: verifica su firma contra
    /// un prototipo previo si existe y promueve la cola de
    /// declaraciones a variables de la función.
    pub fn add_function(
        &mut self,
        name: &str,
        return_type: SymbolType,
        position: Position,
    ) -> Compile<()> {
        let already_defined = self.symbols.iter().any(|s| {
            matches!(
                s.typ.base,
                BaseType::Function | BaseType::EntryPoint | BaseType::SharedFunction
            ) && s.name == name
        });
        if already_defined {
            return Err(declaration(
                format!("Function \"{}\" is already defined", name),
                position,
            ));
        }

        let ip = self.function_ip;
        self.function_ip = self.next_ip();

        if name == ENTRY_POINT_NAME {
            if self.parameter_count != 0 {
                return Err(declaration(
                    "Entry point must have zero parameters",
                    position,
                ));
            }
            if return_type != UINT8 {
                return Err(declaration(
                    "Entry point must return \"uint8\" value",
                    position,
                ));
            }

            // Se recogen todas las variables usadas en la función
            let declarations = std::mem::take(&mut self.declarations);
            for entry in declarations {
                self.promote_declaration(entry, 0, name, position)?;
            }

            self.add_symbol(
                name,
                SymbolType::of(BaseType::EntryPoint),
                0,
                return_type,
                ExpressionType::None,
                ip,
                0,
                None,
                false,
                position,
            )?;

            self.parameter_count = 0;
            return Ok(());
        }

        let prototype = self
            .symbols
            .iter()
            .position(|s| s.typ.base == BaseType::FunctionPrototype && s.name == name);

        if let Some(prototype) = prototype {
            if (self.declarations.is_empty() && self.parameter_count != 0)
                || self.symbols.get(prototype).parameter != self.parameter_count as i32
            {
                return Err(declaration(
                    format!("Parameter count does not match for function \"{}\"", name),
                    position,
                ));
            }

            if self.symbols.get(prototype).return_type != return_type {
                return Err(declaration(
                    format!("Return type does not match for function \"{}\"", name),
                    position,
                ));
            }

            // El prototipo se promueve a función completa
            {
                let symbol = self.symbols.get_mut(prototype);
                symbol.typ = SymbolType::of(BaseType::Function);
                symbol.ip = ip;
            }

            // Los parámetros formales del prototipo deben coincidir en
            // orden de declaración con la cola actual
            let mut queued = 0usize;
            for n in 1..=self.parameter_count as i32 {
                let formal = self
                    .symbols
                    .find_parameter(name, n)
                    .ok_or_else(Diagnostic::internal)?;

                let formal_type = self.symbols.get(formal).typ;
                if formal_type != self.declarations[queued].typ {
                    return Err(declaration(
                        format!(
                            "Parameter \"{}\" type does not match for function \"{}\"",
                            self.symbols.get(formal).name, name
                        ),
                        position,
                    ));
                }

                queued += 1;
            }

            // El resto de la cola son variables locales
            let locals: Vec<Symbol> = self.declarations.drain(..).skip(queued).collect();
            for entry in locals {
                self.promote_declaration(entry, 0, name, position)?;
            }
        } else {
            if self.declarations.is_empty() && self.parameter_count != 0 {
                return Err(declaration(
                    format!("Parameter count does not match for function \"{}\"", name),
                    position,
                ));
            }

            let parameter_count = self.parameter_count;
            let declarations = std::mem::take(&mut self.declarations);
            let mut parameter_current = 0;
            for entry in declarations {
                let parameter = if parameter_current < parameter_count {
                    parameter_current += 1;
                    parameter_current as i32
                } else {
                    0
                };

                self.promote_declaration(entry, parameter, name, position)?;
            }

            self.add_symbol(
                name,
                SymbolType::of(BaseType::Function),
                0,
                return_type,
                ExpressionType::None,
                ip,
                parameter_count as i32,
                None,
                false,
                position,
            )?;
        }

        self.declarations.clear();
        self.parameter_count = 0;
        Ok(())
    }

    fn promote_declaration(
        &mut self,
        entry: Symbol,
        parameter: i32,
        parent: &str,
        position: Position,
    ) -> Compile<()> {
        let index = self.add_symbol(
            &entry.name,
            entry.typ,
            entry.size,
            entry.return_type,
            entry.exp_type,
            entry.ip,
            parameter,
            Some(parent),
            entry.is_temp,
            position,
        )?;

        self.symbols.get_mut(index).const_value = entry.const_value;
        Ok(())
    }

    /// Declara un prototipo de función.
    pub fn add_function_prototype(
        &mut self,
        name: &str,
        return_type: SymbolType,
        position: Position,
    ) -> Compile<()> {
        if name == ENTRY_POINT_NAME {
            return Err(declaration(
                "Prototype for entry point is not allowed",
                position,
            ));
        }
        if self.declarations.is_empty() && self.parameter_count != 0 {
            return Err(declaration("Parameter count does not match", position));
        }

        if self.symbols.iter().any(|s| s.typ.is_callable() && s.name == name) {
            return Err(declaration(
                format!("Duplicate function definition for \"{}\"", name),
                position,
            ));
        }

        self.add_symbol(
            name,
            SymbolType::of(BaseType::FunctionPrototype),
            0,
            return_type,
            ExpressionType::None,
            0,
            self.parameter_count as i32,
            None,
            false,
            position,
        )?;

        let declarations = std::mem::take(&mut self.declarations);
        let mut parameter_current = 0;
        for entry in declarations {
            parameter_current += 1;
            self.promote_declaration(entry, parameter_current, name, position)?;
        }

        self.parameter_count = 0;
        Ok(())
    }

    /// Verifica una llamada contra la firma del invocable y encola una
    /// instrucción `Push` por cada parámetro.
    pub fn prepare_for_call(
        &mut self,
        name: &str,
        call_parameters: &[Operand],
        position: Position,
    ) -> Compile<()> {
        let target = self
            .symbols
            .iter()
            .position(|s| {
                matches!(
                    s.typ.base,
                    BaseType::Function | BaseType::FunctionPrototype | BaseType::SharedFunction
                ) && s.name == name
            })
            .ok_or_else(|| {
                statement(
                    format!("Cannot call function \"{}\", because it was not declared", name),
                    position,
                )
            })?;

        if self.symbols.get(target).parameter != call_parameters.len() as i32 {
            return Err(statement(
                format!(
                    "Cannot call function \"{}\" because of parameter count mismatch",
                    name
                ),
                position,
            ));
        }

        for (n, actual) in call_parameters.iter().enumerate() {
            let formal = self
                .symbols
                .find_parameter(name, n as i32 + 1)
                .ok_or_else(Diagnostic::internal)?;

            let formal_type = self.symbols.get(formal).typ;
            if !crate::sym::can_implicit_cast(formal_type, actual.typ, actual.exp_type) {
                return Err(statement(
                    format!(
                        "Cannot call function \"{}\" because of parameter \"{}\" type mismatch",
                        name,
                        self.symbols.get(formal).name
                    ),
                    position,
                ));
            }

            self.emit(Instruction::Push {
                operand: actual.clone(),
            });
        }

        Ok(())
    }

    /// Busca una variable: primero en la cola de declaraciones de la
    /// función en curso, luego entre las estáticas.
    pub fn find_variable(&self, name: &str) -> Option<&Symbol> {
        self.declarations
            .iter()
            .find(|d| d.name == name)
            .or_else(|| self.symbols.find_global(name).map(|i| self.symbols.get(i)))
    }

    /// Busca un invocable por nombre.
    pub fn find_function(&self, name: &str) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|s| {
                matches!(
                    s.typ.base,
                    BaseType::Function | BaseType::FunctionPrototype | BaseType::SharedFunction
                ) && s.name == name
            })
    }

    /// Genera una variable temporal del tipo indicado y la agrega a la
    /// cola de declaraciones.
    pub fn unused_variable(&mut self, typ: SymbolType, position: Position) -> Compile<String> {
        let name = match typ.base {
            BaseType::Bool => {
                self.var_count_bool += 1;
                format!("#b_{}", self.var_count_bool)
            }
            BaseType::Uint8 => {
                self.var_count_uint8 += 1;
                format!("#ui8_{}", self.var_count_uint8)
            }
            BaseType::Uint16 => {
                self.var_count_uint16 += 1;
                format!("#ui16_{}", self.var_count_uint16)
            }
            BaseType::Uint32 => {
                self.var_count_uint32 += 1;
                format!("#ui32_{}", self.var_count_uint32)
            }
            BaseType::String => {
                self.var_count_string += 1;
                format!("#s_{}", self.var_count_string)
            }
            BaseType::Void if typ.pointer > 0 => {
                self.var_count_uint16 += 1;
                format!("#ui16_{}", self.var_count_uint16)
            }
            _ => return Err(Diagnostic::internal()),
        };

        self.to_declaration(typ, 0, &name, ExpressionType::Variable, position)?;
        if let Some(last) = self.declarations.last_mut() {
            last.is_temp = true;
        }

        Ok(name)
    }

    pub fn increase_scope(&mut self, scope: ScopeType) {
        match scope {
            ScopeType::Assign => self.assign_scope += 1,
            ScopeType::Break => self.break_list.push(Vec::new()),
            ScopeType::Continue => self.continue_list.push(Vec::new()),
        }
    }

    pub fn reset_scope(&mut self, scope: ScopeType) {
        match scope {
            ScopeType::Assign => self.assign_scope = 0,
            _ => unreachable!("only assignment scopes are reset"),
        }
    }

    /// Cierra un nivel de contexto de asignación sin abandonar los
    /// niveles exteriores; usado alrededor de cada parámetro de llamada.
    pub fn decrease_scope(&mut self, scope: ScopeType) {
        match scope {
            ScopeType::Assign => {
                if self.assign_scope > 0 {
                    self.assign_scope -= 1;
                }
            }
            _ => unreachable!("only assignment scopes are decreased"),
        }
    }

    pub fn is_scope_active(&self, scope: ScopeType) -> bool {
        match scope {
            ScopeType::Assign => self.assign_scope > 0,
            ScopeType::Break => !self.break_list.is_empty(),
            ScopeType::Continue => !self.continue_list.is_empty(),
        }
    }

    /// Resuelve y cierra el ámbito más interno de `break` o `continue`.
    pub fn backpatch_scope(&mut self, scope: ScopeType, new_ip: i32) -> Compile<()> {
        let list = match scope {
            ScopeType::Break => self.break_list.pop(),
            ScopeType::Continue => self.continue_list.pop(),
            ScopeType::Assign => None,
        };

        match list {
            Some(list) => self.backpatch(&list, new_ip),
            None => Err(Diagnostic::internal()),
        }
    }

    /// Agrega una lista al ámbito más interno; `false` si no hay
    /// ámbito abierto.
    pub fn add_to_scope(&mut self, scope: ScopeType, backpatch: BackpatchList) -> bool {
        let list = match scope {
            ScopeType::Break => self.break_list.last_mut(),
            ScopeType::Continue => self.continue_list.last_mut(),
            ScopeType::Assign => None,
        };

        match list {
            Some(list) => {
                list.extend(backpatch);
                true
            }
            None => false,
        }
    }

    /// Acciones al completar el análisis: ancla la primera función al
    /// IP 1, resuelve el salto inicial y recorre el grafo de llamadas
    /// desde el punto de entrada marcando lo alcanzable.
    pub fn postprocess(&mut self) -> Compile<()> {
        if self.symbols.is_empty() {
            return Ok(());
        }

        // La primera función emitida comienza en el IP 1; el IP 0 lo
        // ocupa el salto inicial
        for index in 0..self.symbols.len() {
            let symbol = self.symbols.get(index);
            if symbol.parent.is_none()
                && matches!(symbol.typ.base, BaseType::Function | BaseType::EntryPoint)
                && symbol.ip == 0
            {
                self.symbols.get_mut(index).ip = 1;
                break;
            }
        }

        let entry_point = self
            .symbols
            .iter()
            .position(|s| s.parent.is_none() && s.typ.base == BaseType::EntryPoint)
            .ok_or_else(|| compilation("Entry point was lost during parsing"))?;

        let entry_ip = self.symbols.get(entry_point).ip;
        if let Some(Instruction::Goto { target }) = self.stream.first_mut() {
            *target = entry_ip;
        }

        let mut dependencies = vec![entry_point];

        while let Some(index) = dependencies.pop() {
            if self.symbols.get(index).ref_count > 0 {
                // La función ya fue procesada
                continue;
            }

            self.symbols.get_mut(index).ref_count += 1;

            let ip_start = self.symbols.get(index).ip;
            let mut ip = ip_start;

            while (ip as usize) < self.stream.len() {
                if ip != ip_start {
                    let function_boundary = self.symbols.iter().any(|s| {
                        s.ip == ip
                            && matches!(s.typ.base, BaseType::Function | BaseType::EntryPoint)
                    });
                    if function_boundary {
                        break;
                    }
                }

                if let Instruction::Call { target, .. } = &self.stream[ip as usize] {
                    let callee = self
                        .symbols
                        .find_callable(target)
                        .ok_or_else(Diagnostic::internal)?;

                    if self.symbols.get(callee).typ.base == BaseType::SharedFunction {
                        self.symbols.get_mut(callee).ref_count += 1;
                    } else {
                        dependencies.push(callee);
                    }
                }

                ip += 1;
            }
        }

        Ok(())
    }

    /// Libera el estado de análisis y entrega el programa final.
    pub fn finish(self, stack_size: u32) -> Program {
        Program {
            stream: self.stream,
            symbols: self.symbols,
            stack_size,
        }
    }

    /// Declara todas las funciones compartidas del runtime para que
    /// puedan ser invocadas desde el código de usuario.
    fn declare_shared_functions(&mut self) {
        fn declare(
            builder: &mut Builder,
            name: &str,
            return_type: SymbolType,
            parameters: &[(&str, SymbolType)],
        ) {
            let shared = SymbolType::of(BaseType::SharedFunction);
            let position = Position::default();

            builder
                .add_symbol(
                    name,
                    shared,
                    0,
                    return_type,
                    ExpressionType::None,
                    0,
                    parameters.len() as i32,
                    None,
                    false,
                    position,
                )
                .expect("shared function declaration");

            for (n, (parameter, typ)) in parameters.iter().enumerate() {
                builder
                    .add_symbol(
                        parameter,
                        *typ,
                        0,
                        UNKNOWN,
                        ExpressionType::None,
                        0,
                        n as i32 + 1,
                        Some(name),
                        false,
                        position,
                    )
                    .expect("shared function parameter");
            }
        }

        use crate::sym::{BOOL, STRING, UINT32, VOID, VOID_PTR};

        declare(self, "PrintUint32", VOID, &[("value", UINT32)]);
        declare(self, "PrintString", VOID, &[("value", STRING)]);
        declare(self, "PrintNewLine", VOID, &[]);
        declare(self, "ReadUint32", UINT32, &[]);
        declare(self, "GetCommandLine", STRING, &[]);
        declare(self, "#StringsEqual", BOOL, &[("a", STRING), ("b", STRING)]);
        declare(self, "#Alloc", VOID_PTR, &[("bytes", UINT32)]);
        declare(self, "release", VOID, &[("ptr", VOID_PTR)]);
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::CompareOp;
    use crate::sym::{BOOL, UINT32};

    fn pos() -> Position {
        Position::default()
    }

    #[test]
    fn stream_starts_with_entry_goto() {
        let builder = Builder::new();
        assert!(matches!(builder.stream[0], Instruction::Goto { target: -1 }));
        assert_eq!(builder.next_ip(), 1);
    }

    #[test]
    fn backpatch_resolves_jump_targets() {
        let mut builder = Builder::new();
        let list = builder.emit_with_backpatch(Instruction::If {
            op: CompareOp::Equal,
            op1: Operand::constant("1", UINT8),
            op2: Operand::constant("1", UINT8),
            target: -1,
        });

        builder.backpatch(&list, 7).unwrap();
        assert!(matches!(
            builder.stream[list[0]],
            Instruction::If { target: 7, .. }
        ));
    }

    #[test]
    fn break_outside_loop_is_detected() {
        let mut builder = Builder::new();
        assert!(!builder.add_to_scope(ScopeType::Break, vec![]));

        builder.increase_scope(ScopeType::Break);
        assert!(builder.add_to_scope(ScopeType::Break, vec![]));
        builder.backpatch_scope(ScopeType::Break, 0).unwrap();
        assert!(!builder.add_to_scope(ScopeType::Break, vec![]));
    }

    #[test]
    fn temporaries_use_type_tags() {
        let mut builder = Builder::new();
        assert_eq!(builder.unused_variable(BOOL, pos()).unwrap(), "#b_1");
        assert_eq!(builder.unused_variable(BOOL, pos()).unwrap(), "#b_2");
        assert_eq!(builder.unused_variable(UINT32, pos()).unwrap(), "#ui32_1");

        let temp = builder.find_variable("#b_1").unwrap();
        assert!(temp.is_temp);
    }

    #[test]
    fn entry_point_signature_is_enforced() {
        let mut builder = Builder::new();
        let error = builder.add_function(ENTRY_POINT_NAME, UINT32, pos()).unwrap_err();
        assert!(error.message.contains("uint8"));

        let mut builder = Builder::new();
        builder.to_parameter(UINT32, "x", pos()).unwrap();
        let error = builder.add_function(ENTRY_POINT_NAME, UINT8, pos()).unwrap_err();
        assert!(error.message.contains("zero parameters"));
    }

    #[test]
    fn postprocess_marks_reachable_functions() {
        let mut builder = Builder::new();

        // uint32 Helper() { return 1; }  (ip 1)
        builder.emit(Instruction::Return {
            operand: Some(Operand::constant("1", UINT32)),
        });
        builder.add_function("Helper", UINT32, pos()).unwrap();

        // uint32 Unused() { return 2; }  (ip 2)
        builder.emit(Instruction::Return {
            operand: Some(Operand::constant("2", UINT32)),
        });
        builder.add_function("Unused", UINT32, pos()).unwrap();

        // uint8 Main() { Helper(); return 0; }  (ip 3)
        let temp = builder.unused_variable(UINT32, pos()).unwrap();
        builder.emit(Instruction::Call {
            target: "Helper".to_string(),
            return_symbol: Some(temp),
        });
        builder.emit(Instruction::Return {
            operand: Some(Operand::constant("0", UINT8)),
        });
        builder.add_function(ENTRY_POINT_NAME, UINT8, pos()).unwrap();

        builder.postprocess().unwrap();

        let ref_count = |name: &str| {
            builder
                .symbols
                .iter()
                .find(|s| s.name == name)
                .unwrap()
                .ref_count
        };

        assert_eq!(ref_count("Helper"), 1);
        assert_eq!(ref_count("Unused"), 0);
        assert_eq!(ref_count(ENTRY_POINT_NAME), 1);

        // El salto inicial apunta al cuerpo del punto de entrada
        assert!(matches!(builder.stream[0], Instruction::Goto { target: 3 }));
    }

    #[test]
    fn first_function_is_anchored_past_entry_goto() {
        let mut builder = Builder::new();

        builder.emit(Instruction::Return {
            operand: Some(Operand::constant("0", UINT8)),
        });
        builder.add_function(ENTRY_POINT_NAME, UINT8, pos()).unwrap();
        builder.postprocess().unwrap();

        let main = builder
            .symbols
            .iter()
            .find(|s| s.name == ENTRY_POINT_NAME)
            .unwrap();
        assert_eq!(main.ip, 1);
    }
}
