//! Generación de código nativo.
//!
//! El emisor recorre la representación intermedia en una sola pasada
//! hacia adelante y produce la imagen ejecutable completa: encabezado
//! MZ, código de las funciones alcanzables, rutinas del runtime
//! referenciadas, literales de cadena y la región estática.
//!
//! El invariante central es el vaciado en los puntos de unión: antes
//! de emitir cualquier IP que sea destino de un salto, y en cada
//! etiqueta, toda variable se escribe a memoria y todos los registros
//! se liberan, de modo que el estado de registros es vacío en cada
//! confluencia de flujo y los bloques no dependen de sus predecesores.
//!
//! Los destinos aún no emitidos quedan en una lista de backpatch
//! nativa: saltos relativos (8 o 16 bits), llamadas a funciones,
//! direcciones de cadenas y estáticas, y offsets de pila de locales.

pub mod i386;
mod regs;
mod runtime;

use crate::error::{compilation, Compile, Diagnostic};
use crate::exe;
use crate::ir::{parse_constant, AssignOp, CompareOp, Instruction, Operand, OperandIndex};
use crate::semantic::Program;
use crate::sym::{size_of, BaseType, ExpressionType, SymbolTable, VOID};

use i386::{opr, xrm, Buffer, Reg, Segment};
use regs::{SaveReason, Var};

use std::collections::{HashMap, HashSet};

/// Máxima cantidad de instrucciones abstractas que se estima caben en
/// una dirección relativa de 8 bits.
const NEAR_JUMP_THRESHOLD: i32 = 10;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FixupKind {
    Rel8,
    Rel16,
    DsAbs16,
    Stack8,
}

#[derive(Clone, Debug, PartialEq)]
enum FixupTarget {
    /// IP abstracto aún no emitido.
    Ip(i32),

    /// Etiqueta local a la función en curso.
    Label(String),

    /// Función aún no emitida (incluye las rutinas del runtime).
    Function(String),

    /// Literal de cadena; se resuelve al emitir la tabla de cadenas.
    Str(String),

    /// Offset de pila de una variable local, asignado en el epílogo.
    Local(String),

    /// Dirección de una variable estática.
    Static(String),
}

impl FixupTarget {
    fn name(&self) -> Option<&str> {
        match self {
            FixupTarget::Ip(_) => None,
            FixupTarget::Label(name)
            | FixupTarget::Function(name)
            | FixupTarget::Str(name)
            | FixupTarget::Local(name)
            | FixupTarget::Static(name) => Some(name),
        }
    }
}

struct Fixup {
    kind: FixupKind,
    target: FixupTarget,

    /// Offset absoluto del hueco dentro del búfer.
    offset: usize,

    /// IP nativo base para el cálculo de direcciones relativas.
    ip: i32,
}

/// Una etiqueta nativa resuelta: nombre y IP de destino.
struct NativeLabel {
    name: String,
    ip_dst: i32,
}

/// Traduce el programa a una imagen MZ completa.
pub fn emit(program: &mut Program) -> Compile<Vec<u8>> {
    let stack_size = program.stack_size;
    let mut emitter = Emitter::new(&program.stream, &mut program.symbols);

    exe::emit_header(&mut emitter.buf);
    emitter.emit_instructions()?;
    emitter.emit_shared_functions()?;
    emitter.emit_static_data()?;
    emitter.finalize(stack_size)?;
    emitter.save()
}

pub(crate) struct Emitter<'a> {
    stream: &'a [Instruction],
    symbols: &'a mut SymbolTable,

    buf: Buffer,
    ip_src: i32,
    static_size: i32,

    ip_src_to_dst: HashMap<i32, i32>,
    fixups: Vec<Fixup>,
    vars: Vec<Var>,
    functions: Vec<NativeLabel>,
    labels: Vec<NativeLabel>,

    /// Literales de cadena deduplicados, en orden de aparición.
    strings: Vec<String>,

    suppressed: Vec<Reg>,

    parent: Option<usize>,
    parent_end_ip: i32,
    parent_stack_offset: usize,
    was_return: bool,

    /// IP nativo del prólogo del punto de entrada.
    entry_ip_dst: Option<i32>,

    /// Pila de instrucciones `Push` pendientes de la próxima llamada.
    call_parameters: Vec<usize>,
}

impl<'a> Emitter<'a> {
    fn new(stream: &'a [Instruction], symbols: &'a mut SymbolTable) -> Self {
        Emitter {
            stream,
            symbols,
            buf: Buffer::new(),
            ip_src: 0,
            static_size: 0,
            ip_src_to_dst: HashMap::new(),
            fixups: Vec::new(),
            vars: Vec::new(),
            functions: Vec::new(),
            labels: Vec::new(),
            strings: Vec::new(),
            suppressed: Vec::new(),
            parent: None,
            parent_end_ip: 0,
            parent_stack_offset: 0,
            was_return: false,
            entry_ip_dst: None,
            call_parameters: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Barrido principal

    fn emit_instructions(&mut self) -> Compile<()> {
        self.create_variable_list();

        // IPs destino de saltos: ahí los registros deben vaciarse
        let mut discontinuous: HashSet<i32> = HashSet::new();
        for instruction in self.stream {
            match instruction {
                Instruction::Goto { target } => {
                    discontinuous.insert(*target);
                }
                Instruction::If { target, .. } => {
                    discontinuous.insert(*target);
                }
                _ => {}
            }
        }

        // El salto inicial al punto de entrada no genera código
        if let Some(Instruction::Goto { .. }) = self.stream.first() {
            self.ip_src = 1;
        }

        let stream = self.stream;
        while (self.ip_src as usize) < stream.len() {
            if discontinuous.contains(&self.ip_src) {
                self.save_and_unload_all(SaveReason::Before)?;
            }

            // Conversión de IP abstracto a IP nativo
            self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());

            self.process_symbol_linkage()?;
            if self.ip_src as usize >= stream.len() {
                break;
            }

            // Los saltos hacia adelante a este punto se resuelven con
            // la conversión previa al prólogo; los posteriores verán
            // la posición real de la instrucción
            self.backpatch_addresses()?;
            self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());

            self.was_return = false;

            match stream[self.ip_src as usize].clone() {
                Instruction::Nop => {}
                Instruction::Assign {
                    op,
                    dst,
                    dst_index,
                    op1,
                    op2,
                } => self.emit_assign(op, &dst, dst_index, op1, op2)?,
                Instruction::Goto { target } => self.emit_goto(target)?,
                Instruction::GotoLabel { label } => self.emit_goto_label(&label)?,
                Instruction::If {
                    op,
                    op1,
                    op2,
                    target,
                } => self.emit_if(op, op1, op2, target)?,
                Instruction::Push { .. } => {
                    self.call_parameters.push(self.ip_src as usize);
                }
                Instruction::Call {
                    target,
                    return_symbol,
                } => self.emit_call(&target, return_symbol.as_deref())?,
                Instruction::Return { operand } => self.emit_return(operand.as_ref())?,
            }

            self.ip_src += 1;
        }

        // Los saltos al final de la última función aterrizan en su
        // retorno sintetizado
        self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());
        self.backpatch_addresses()?;

        self.emit_function_epilogue()
    }

    /// Acciones ligadas a símbolos cuyo IP coincide con el actual:
    /// inicio de funciones, punto de entrada y etiquetas.
    fn process_symbol_linkage(&mut self) -> Compile<()> {
        'retry: loop {
            for index in 0..self.symbols.len() {
                if self.symbols.get(index).ip != self.ip_src {
                    continue;
                }

                match self.symbols.get(index).typ.base {
                    BaseType::EntryPoint => {
                        self.emit_function_epilogue()?;
                        self.emit_entry_point_prologue(index);
                        self.refresh_parent_end_ip();
                    }

                    BaseType::Function => {
                        self.emit_function_epilogue()?;

                        if self.symbols.get(index).ref_count == 0 {
                            // La función no se referencia; sus
                            // instrucciones se omiten por completo
                            self.ip_src += 1;
                            while (self.ip_src as usize) < self.stream.len() {
                                let boundary = self.symbols.iter().any(|s| {
                                    s.ip == self.ip_src
                                        && matches!(
                                            s.typ.base,
                                            BaseType::Function | BaseType::EntryPoint
                                        )
                                });
                                if boundary {
                                    break;
                                }

                                self.ip_src += 1;
                            }

                            self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());
                            continue 'retry;
                        }

                        self.emit_function_prologue(index)?;
                        self.refresh_parent_end_ip();
                    }

                    BaseType::Label => {
                        // Punto de unión: los registros se vacían para
                        // poder saltar aquí sin estado previo
                        self.save_and_unload_all(SaveReason::Before)?;
                        self.ip_src_to_dst.insert(self.ip_src, self.buf.ip());

                        let name = self.symbols.get(index).name.clone();
                        let ip_dst = self.buf.ip();
                        self.labels.push(NativeLabel {
                            name: name.clone(),
                            ip_dst,
                        });
                        self.backpatch_labels(&name, ip_dst, |t| {
                            matches!(t, FixupTarget::Label(_))
                        })?;
                    }

                    _ => {}
                }
            }

            return Ok(());
        }
    }

    /// Determina el último IP de la función en curso.
    fn refresh_parent_end_ip(&mut self) {
        for ip in (self.ip_src + 1)..(self.stream.len() as i32) {
            let boundary = self.symbols.iter().any(|s| {
                s.ip == ip && matches!(s.typ.base, BaseType::Function | BaseType::EntryPoint)
            });
            if boundary {
                self.parent_end_ip = ip - 1;
                return;
            }
        }

        self.parent_end_ip = self.stream.len() as i32 - 1;
    }

    // ------------------------------------------------------------------
    // Backpatch nativo

    /// Resuelve los huecos pendientes cuyo IP abstracto ya tiene
    /// posición nativa conocida.
    fn backpatch_addresses(&mut self) -> Compile<()> {
        let mut index = 0;
        while index < self.fixups.len() {
            let ip_dst = match self.fixups[index].target {
                FixupTarget::Ip(target) => match self.ip_src_to_dst.get(&target) {
                    Some(ip_dst) => *ip_dst,
                    None => {
                        index += 1;
                        continue;
                    }
                },
                _ => {
                    index += 1;
                    continue;
                }
            };

            let fixup = self.fixups.remove(index);
            match fixup.kind {
                FixupKind::Rel8 => {
                    let rel8 = ip_dst - fixup.ip;
                    if rel8 < i8::MIN as i32 || rel8 > i8::MAX as i32 {
                        return Err(compilation(
                            "Compiler cannot generate that high relative address",
                        ));
                    }

                    self.buf.patch_i8(fixup.offset, rel8 as i8);
                }
                FixupKind::Rel16 => {
                    self.buf.patch_i16(fixup.offset, (ip_dst - fixup.ip) as i16);
                }
                _ => return Err(Diagnostic::internal()),
            }
        }

        Ok(())
    }

    /// Resuelve los huecos de un destino con nombre recién definido.
    fn backpatch_labels<F>(&mut self, name: &str, value: i32, matches: F) -> Compile<()>
    where
        F: Fn(&FixupTarget) -> bool,
    {
        let mut index = 0;
        while index < self.fixups.len() {
            let fixup = &self.fixups[index];
            if !matches(&fixup.target) || fixup.target.name() != Some(name) {
                index += 1;
                continue;
            }

            let fixup = self.fixups.remove(index);
            match fixup.kind {
                FixupKind::Rel8 => {
                    let rel8 = value - fixup.ip;
                    if rel8 < i8::MIN as i32 || rel8 > i8::MAX as i32 {
                        return Err(compilation(
                            "Compiler cannot generate that high relative address",
                        ));
                    }

                    self.buf.patch_i8(fixup.offset, rel8 as i8);
                }
                FixupKind::Rel16 => {
                    self.buf.patch_i16(fixup.offset, (value - fixup.ip) as i16);
                }
                FixupKind::DsAbs16 => {
                    // Las direcciones de datos son relativas a DS, que
                    // apunta al PSP en el modelo plano
                    self.buf
                        .patch_u16(fixup.offset, (value as u16).wrapping_add(exe::PSP_SIZE));
                }
                FixupKind::Stack8 => {
                    self.buf.patch_i8(fixup.offset, value as i8);
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Fronteras de función

    fn emit_entry_point_prologue(&mut self, function: usize) {
        self.parent = Some(function);
        self.entry_ip_dst = Some(self.buf.ip());

        // Modelo plano: SS y ES se igualan a DS
        self.buf.asm_mov_from_segment(Reg::Ax, Segment::Ds);
        self.buf.asm_mov_to_segment(Segment::Ss, Reg::Ax);
        self.buf.asm_mov_to_segment(Segment::Es, Reg::Ax);

        // mov ebp, esp
        self.buf
            .code(&[0x66, 0x8B, xrm(3, Reg::Bp.code(), Reg::Sp.code())]);

        // sub sp, <tamaño de locales>; el hueco se llena en el epílogo
        let offset = self.buf.code(&[0x81, xrm(3, 5, Reg::Sp.code()), 0, 0]);
        self.parent_stack_offset = offset + 2;

        self.labels.clear();
    }

    fn emit_function_prologue(&mut self, function: usize) -> Compile<()> {
        self.parent = Some(function);
        let name = self.symbols.get(function).name.clone();

        let ip_dst = self.buf.ip();
        self.backpatch_labels(&name, ip_dst, |t| matches!(t, FixupTarget::Function(_)))?;
        self.functions.push(NativeLabel {
            name: name.clone(),
            ip_dst,
        });

        self.buf.asm_proc_enter();

        // Offsets de parámetros: 4 bytes de ebp guardado más 2 bytes
        // de dirección de retorno dejan el primero en +6
        let mut stack_param_size = 0;
        for index in 0..self.vars.len() {
            let symbol = self.symbols.get(self.vars[index].sym);
            if symbol.parent.as_deref() == Some(name.as_str()) && symbol.parameter != 0 {
                let size = size_of(symbol.typ).max(2);
                self.vars[index].location = Some(stack_param_size + 6);
                stack_param_size += size;
            }
        }

        let offset = self.buf.code(&[0x81, xrm(3, 5, Reg::Sp.code()), 0, 0]);
        self.parent_stack_offset = offset + 2;

        self.labels.clear();
        Ok(())
    }

    /// Cierra la función anterior: offsets de locales, tamaño del
    /// marco y verificación de resolución completa.
    fn emit_function_epilogue(&mut self) -> Compile<()> {
        let parent = match self.parent {
            Some(parent) => parent,
            None => return Ok(()),
        };

        self.check_return_statement_present()?;

        let parent_name = self.symbols.get(parent).name.clone();

        let mut stack_var_size: i32 = 0;
        for index in 0..self.vars.len() {
            let (matches_parent, is_parameter, size, ref_count, name) = {
                let symbol = self.symbols.get(self.vars[index].sym);
                let size = if symbol.size > 0 {
                    symbol.size * size_of(symbol.typ.dereference())
                } else {
                    size_of(symbol.typ)
                };

                (
                    symbol.parent.as_deref() == Some(parent_name.as_str()),
                    symbol.parameter != 0,
                    size,
                    symbol.ref_count,
                    symbol.name.clone(),
                )
            };

            if !matches_parent || is_parameter {
                continue;
            }

            if ref_count == 0 {
                // La variable nunca se escribió a memoria; no ocupa pila
                continue;
            }

            stack_var_size += size;
            self.vars[index].location = Some(-stack_var_size);
            self.backpatch_labels(&name, -stack_var_size, |t| {
                matches!(t, FixupTarget::Local(_))
            })?;
        }

        if self.parent_stack_offset == 0 {
            return Err(Diagnostic::internal());
        }

        if stack_var_size >= i8::MAX as i32 {
            return Err(compilation("Compiler cannot generate that high address offset"));
        }

        self.buf
            .patch_u16(self.parent_stack_offset, stack_var_size as u16);

        // Nada local puede quedar sin resolver al cerrar la función
        for fixup in &self.fixups {
            match &fixup.target {
                FixupTarget::Local(_) => return Err(Diagnostic::internal()),
                FixupTarget::Label(name) => {
                    return Err(crate::error::compilation(format!(
                        "Label \"{}\" could not be resolved",
                        name
                    )));
                }
                _ => {}
            }
        }

        // El estado de registros muere con la función
        for var in &mut self.vars {
            var.reg = None;
            var.dirty = false;
        }

        self.parent = None;
        self.parent_stack_offset = 0;
        Ok(())
    }

    /// Una función sin `return` terminal es fatal, salvo que retorne
    /// `void`: en ese caso el retorno se sintetiza.
    fn check_return_statement_present(&mut self) -> Compile<()> {
        let parent = match self.parent {
            Some(parent) => parent,
            None => return Ok(()),
        };

        if self.was_return {
            return Ok(());
        }

        let symbol = self.symbols.get(parent);
        if symbol.return_type == VOID {
            self.emit_return(None)?;
            Ok(())
        } else {
            Err(compilation(format!(
                "Function \"{}\" must have \"return\" as the last statement",
                symbol.name
            )))
        }
    }

    // ------------------------------------------------------------------
    // Traducción de instrucciones

    fn emit_assign(
        &mut self,
        op: AssignOp,
        dst: &str,
        dst_index: Option<OperandIndex>,
        op1: Operand,
        op2: Option<Operand>,
    ) -> Compile<()> {
        match op {
            AssignOp::None => self.emit_assign_none(dst, dst_index, op1),
            AssignOp::Negation => self.emit_assign_negation(dst, op1),
            AssignOp::Add | AssignOp::Subtract => {
                let op2 = op2.ok_or_else(Diagnostic::internal)?;
                self.emit_assign_add_subtract(op, dst, op1, op2)
            }
            AssignOp::Multiply => {
                let op2 = op2.ok_or_else(Diagnostic::internal)?;
                self.emit_assign_multiply(dst, op1, op2)
            }
            AssignOp::Divide | AssignOp::Remainder => {
                let op2 = op2.ok_or_else(Diagnostic::internal)?;
                self.emit_assign_divide(op, dst, op1, op2)
            }
            AssignOp::ShiftLeft | AssignOp::ShiftRight => {
                let op2 = op2.ok_or_else(Diagnostic::internal)?;
                self.emit_assign_shift(op, dst, op1, op2)
            }
        }
    }

    fn emit_assign_none(
        &mut self,
        dst: &str,
        dst_index: Option<OperandIndex>,
        op1: Operand,
    ) -> Compile<()> {
        let dst_var = self.find_variable(dst)?;

        let reg_dst = match op1.exp_type {
            ExpressionType::Constant => {
                if op1.typ.base == BaseType::String {
                    // Dirección del literal, resuelta contra la tabla
                    // de cadenas
                    let reg = self.get_unused_register()?;
                    let offset = self.buf.code(&[opr(0xB8, reg), 0, 0]);
                    self.fixup_string(offset + 1, &op1.value);
                    reg
                } else {
                    let reg = self.get_unused_register()?;
                    let dst_size = self.var_size(dst_var);
                    self.load_constant_to_register(op1.constant_value(), reg, dst_size)?;
                    reg
                }
            }

            ExpressionType::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                let dst_size = self.var_size(dst_var);

                if let Some(index) = &op1.index {
                    self.load_indexed_variable(op1_var, index, dst_size)?
                } else {
                    let dst_pointer = self.symbols.get(self.vars[dst_var].sym).typ.pointer;
                    let op1_pointer = self.symbols.get(self.vars[op1_var].sym).typ.pointer;
                    let needs_reference = dst_index.is_none() && dst_pointer > op1_pointer;

                    if needs_reference {
                        // Se toma la dirección; la variable debe
                        // conservar su lugar de pila
                        self.vars[op1_var].force_save = true;
                        self.load_variable_pointer(op1_var, true)?
                    } else {
                        self.load_variable_unreferenced(op1_var, dst_size)?
                    }
                }
            }

            ExpressionType::None => return Err(Diagnostic::internal()),
        };

        if let Some(index) = &dst_index {
            // Los valores indexados no se mantienen en registros
            self.save_indexed_variable(dst_var, index, reg_dst)?;
        } else {
            self.vars[dst_var].reg = Some(reg_dst);
            self.vars[dst_var].dirty = true;
        }
        self.vars[dst_var].last_used = self.ip_src;

        Ok(())
    }

    fn emit_assign_negation(&mut self, dst: &str, op1: Operand) -> Compile<()> {
        let dst_var = self.find_variable(dst)?;

        let reg_dst = match self.vars[dst_var].reg {
            Some(reg) => reg,
            None => self.get_unused_register()?,
        };

        let dst_size = self.var_size(dst_var);

        match op1.exp_type {
            ExpressionType::Constant => {
                self.load_constant_to_register(op1.constant_value(), reg_dst, dst_size)?;
            }
            ExpressionType::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                self.copy_variable_to_register(op1_var, reg_dst, dst_size)?;
            }
            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        match dst_size {
            1 => {
                self.buf.code(&[0xF6, xrm(3, 3, reg_dst.code())]);
            }
            2 => {
                self.buf.code(&[0xF7, xrm(3, 3, reg_dst.code())]);
            }
            _ => {
                self.buf.code(&[0x66, 0xF7, xrm(3, 3, reg_dst.code())]);
            }
        }

        self.vars[dst_var].reg = Some(reg_dst);
        self.vars[dst_var].dirty = true;
        self.vars[dst_var].last_used = self.ip_src;
        Ok(())
    }

    fn emit_assign_add_subtract(
        &mut self,
        op: AssignOp,
        dst: &str,
        op1: Operand,
        op2: Operand,
    ) -> Compile<()> {
        let dst_var = self.find_variable(dst)?;

        // Concatenación de literales de cadena
        if op == AssignOp::Add && self.symbols.get(self.vars[dst_var].sym).typ.base == BaseType::String
        {
            if op1.exp_type != ExpressionType::Constant || op2.exp_type != ExpressionType::Constant
            {
                return Err(Diagnostic::internal());
            }

            let concat = format!("{}{}", op1.value, op2.value);

            let reg = self.get_unused_register()?;
            let offset = self.buf.code(&[opr(0xB8, reg), 0, 0]);
            self.fixup_string(offset + 1, &concat);

            self.vars[dst_var].reg = Some(reg);
            self.vars[dst_var].dirty = true;
            self.vars[dst_var].last_used = self.ip_src;
            return Ok(());
        }

        let (op1, op2, constant_swapped) = if op1.exp_type == ExpressionType::Constant {
            // La constante debe ser el segundo operando
            (op2, op1, true)
        } else {
            (op1, op2, false)
        };

        let dst_size = self.var_size(dst_var);

        if op1.exp_type == ExpressionType::Constant {
            // Ambos operandos son constantes; se pliega aquí
            let value1 = op1.constant_value();
            let value2 = op2.constant_value();
            let folded = if op == AssignOp::Add {
                value1.wrapping_add(value2)
            } else {
                value1.wrapping_sub(value2)
            };

            let reg_dst = self.get_unused_register()?;
            self.load_constant_to_register(folded, reg_dst, dst_size)?;

            self.vars[dst_var].reg = Some(reg_dst);
            self.vars[dst_var].dirty = true;
            self.vars[dst_var].last_used = self.ip_src;
            return Ok(());
        }

        let op1_var = self.find_variable(&op1.value)?;

        let reg_dst = if dst_var == op1_var && self.vars[op1_var].reg.is_some() {
            self.vars[op1_var].reg.unwrap()
        } else {
            self.load_variable_unreferenced(op1_var, dst_size)?
        };

        match op2.exp_type {
            ExpressionType::Constant => {
                let mut value = op2.constant_value();
                if op == AssignOp::Subtract {
                    value = value.wrapping_neg();
                }

                match dst_size {
                    1 => {
                        self.buf
                            .code(&[0x80, xrm(3, 0, reg_dst.code()), value as u8]);
                    }
                    2 => {
                        self.buf.code(&[
                            0x81,
                            xrm(3, 0, reg_dst.code()),
                            value as u8,
                            (value >> 8) as u8,
                        ]);
                    }
                    _ => {
                        self.buf.code(&[
                            0x66,
                            0x81,
                            xrm(3, 0, reg_dst.code()),
                            value as u8,
                            (value >> 8) as u8,
                            (value >> 16) as u8,
                            (value >> 24) as u8,
                        ]);
                    }
                }

                // "c - x" se emitió como "x + (-c)"; falta negar
                if op == AssignOp::Subtract && constant_swapped {
                    match dst_size {
                        1 => {
                            self.buf.code(&[0xF6, xrm(3, 3, reg_dst.code())]);
                        }
                        2 => {
                            self.buf.code(&[0xF7, xrm(3, 3, reg_dst.code())]);
                        }
                        _ => {
                            self.buf.code(&[0x66, 0xF7, xrm(3, 3, reg_dst.code())]);
                        }
                    }
                }
            }

            ExpressionType::Variable => {
                let op2_var = self.find_variable(&op2.value)?;
                let op2_size = self.var_size(op2_var);

                if op2_size < dst_size {
                    self.with_suppressed(&[reg_dst], |e| {
                        let reg = e.load_variable_unreferenced(op2_var, dst_size)?;
                        e.vars[op2_var].reg = Some(reg);
                        Ok(())
                    })?;
                }

                let opcode8 = if op == AssignOp::Add { 0x02 } else { 0x2A };
                let opcode16 = if op == AssignOp::Add { 0x03 } else { 0x2B };
                self.emit_rm_operation(op2_var, reg_dst, dst_size, opcode8, opcode16)?;
            }

            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        self.vars[dst_var].reg = Some(reg_dst);
        self.vars[dst_var].dirty = true;
        self.vars[dst_var].last_used = self.ip_src;
        Ok(())
    }

    /// Operación `op r, rm` donde el segundo operando vive en un
    /// registro, en una estática o en la pila.
    fn emit_rm_operation(
        &mut self,
        rm_var: usize,
        reg_dst: Reg,
        size: i32,
        opcode8: u8,
        opcode16: u8,
    ) -> Compile<()> {
        let is_local = self.symbols.get(self.vars[rm_var].sym).parent.is_some();

        match size {
            1 => {
                if let Some(reg) = self.vars[rm_var].reg {
                    self.buf.code(&[opcode8, xrm(3, reg_dst.code(), reg.code())]);
                } else if !is_local {
                    let offset = self.buf.code(&[opcode8, xrm(0, reg_dst.code(), 6), 0, 0]);
                    self.fixup_static(offset + 2, rm_var);
                } else {
                    let offset = self.buf.code(&[opcode8, xrm(1, reg_dst.code(), 6), 0]);
                    self.fixup_local(offset + 2, rm_var);
                }
            }
            2 => {
                if let Some(reg) = self.vars[rm_var].reg {
                    self.buf.code(&[opcode16, xrm(3, reg_dst.code(), reg.code())]);
                } else if !is_local {
                    let offset = self.buf.code(&[opcode16, xrm(0, reg_dst.code(), 6), 0, 0]);
                    self.fixup_static(offset + 2, rm_var);
                } else {
                    let offset = self.buf.code(&[opcode16, xrm(1, reg_dst.code(), 6), 0]);
                    self.fixup_local(offset + 2, rm_var);
                }
            }
            _ => {
                if let Some(reg) = self.vars[rm_var].reg {
                    self.buf
                        .code(&[0x66, opcode16, xrm(3, reg_dst.code(), reg.code())]);
                } else if !is_local {
                    let offset = self
                        .buf
                        .code(&[0x66, opcode16, xrm(0, reg_dst.code(), 6), 0, 0]);
                    self.fixup_static(offset + 3, rm_var);
                } else {
                    let offset = self.buf.code(&[0x66, opcode16, xrm(1, reg_dst.code(), 6), 0]);
                    self.fixup_local(offset + 3, rm_var);
                }
            }
        }

        Ok(())
    }

    /// Operación de grupo `op /n rm` (mul, div) contra la ubicación
    /// del operando.
    fn emit_rm_group_operation(&mut self, rm_var: usize, group: u8, size: i32) -> Compile<()> {
        let is_local = self.symbols.get(self.vars[rm_var].sym).parent.is_some();
        let opcode = if size == 1 { 0xF6 } else { 0xF7 };
        let prefix = size >= 4;

        if let Some(reg) = self.vars[rm_var].reg {
            if prefix {
                self.buf.code(&[0x66, opcode, xrm(3, group, reg.code())]);
            } else {
                self.buf.code(&[opcode, xrm(3, group, reg.code())]);
            }
        } else if !is_local {
            if prefix {
                let offset = self.buf.code(&[0x66, opcode, xrm(0, group, 6), 0, 0]);
                self.fixup_static(offset + 3, rm_var);
            } else {
                let offset = self.buf.code(&[opcode, xrm(0, group, 6), 0, 0]);
                self.fixup_static(offset + 2, rm_var);
            }
        } else if prefix {
            let offset = self.buf.code(&[0x66, opcode, xrm(1, group, 6), 0]);
            self.fixup_local(offset + 3, rm_var);
        } else {
            let offset = self.buf.code(&[opcode, xrm(1, group, 6), 0]);
            self.fixup_local(offset + 2, rm_var);
        }

        Ok(())
    }

    fn emit_assign_multiply(&mut self, dst: &str, op1: Operand, op2: Operand) -> Compile<()> {
        let dst_var = self.find_variable(dst)?;
        let dst_size = self.var_size(dst_var);

        let (op1, op2) = if op1.exp_type == ExpressionType::Constant {
            (op2, op1)
        } else {
            (op1, op2)
        };

        if op1.exp_type == ExpressionType::Constant {
            let folded = op1.constant_value().wrapping_mul(op2.constant_value());

            let reg_dst = self.get_unused_register()?;
            self.load_constant_to_register(folded, reg_dst, dst_size)?;

            self.vars[dst_var].reg = Some(reg_dst);
            self.vars[dst_var].dirty = true;
            self.vars[dst_var].last_used = self.ip_src;
            return Ok(());
        }

        let op1_var = self.find_variable(&op1.value)?;

        match op2.exp_type {
            ExpressionType::Constant => {
                self.save_and_unload_register(Reg::Ax, SaveReason::Inside)?;
                self.load_constant_to_register(op2.constant_value(), Reg::Ax, dst_size)?;

                self.with_suppressed(&[Reg::Ax], |e| {
                    if e.var_size(op1_var) < dst_size {
                        let reg = e.load_variable_unreferenced(op1_var, dst_size)?;
                        e.vars[op1_var].reg = Some(reg);
                    }

                    if dst_size >= 2 {
                        // mul descarta DX
                        e.save_and_unload_register(Reg::Dx, SaveReason::Inside)?;
                    }

                    e.emit_rm_group_operation(op1_var, 4, dst_size)
                })?;
            }

            ExpressionType::Variable => {
                let op2_var = self.find_variable(&op2.value)?;

                // Un operando tiene que estar en AX; si el segundo ya
                // lo está, se intercambian
                let (op1_var, op2_var) = if self.vars[op2_var].reg == Some(Reg::Ax) {
                    (op2_var, op1_var)
                } else {
                    (op1_var, op2_var)
                };

                self.copy_variable_to_register(op1_var, Reg::Ax, dst_size)?;

                self.with_suppressed(&[Reg::Ax], |e| {
                    if e.var_size(op2_var) < dst_size {
                        let reg = e.load_variable_unreferenced(op2_var, dst_size)?;
                        e.vars[op2_var].reg = Some(reg);
                    }

                    if dst_size >= 2 {
                        e.save_and_unload_register(Reg::Dx, SaveReason::Inside)?;
                    }

                    e.emit_rm_group_operation(op2_var, 4, dst_size)
                })?;
            }

            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        self.vars[dst_var].reg = Some(Reg::Ax);
        self.vars[dst_var].dirty = true;
        self.vars[dst_var].last_used = self.ip_src;
        Ok(())
    }

    fn emit_assign_divide(
        &mut self,
        op: AssignOp,
        dst: &str,
        op1: Operand,
        op2: Operand,
    ) -> Compile<()> {
        let dst_var = self.find_variable(dst)?;
        let dst_size = self.var_size(dst_var);

        // El dividendo se carga con un tamaño mayor al del destino
        // para que la mitad alta llegue limpia a la división
        match op1.exp_type {
            ExpressionType::Constant => {
                self.save_and_unload_register(Reg::Ax, SaveReason::Inside)?;
                self.load_constant_to_register(op1.constant_value(), Reg::Ax, dst_size * 2)?;
            }
            ExpressionType::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                self.copy_variable_to_register(op1_var, Reg::Ax, dst_size * 2)?;
            }
            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        self.with_suppressed(&[Reg::Ax, Reg::Dx], |e| {
            // El divisor queda en un registro propio o en memoria
            enum Divisor {
                InRegister(Reg),
                Variable(usize),
            }

            let divisor = match op2.exp_type {
                ExpressionType::Constant => {
                    let reg = e.get_unused_register()?;
                    e.load_constant_to_register(op2.constant_value(), reg, dst_size)?;
                    Divisor::InRegister(reg)
                }
                ExpressionType::Variable => {
                    let op2_var = e.find_variable(&op2.value)?;
                    if e.var_size(op2_var) < dst_size {
                        let reg = e.load_variable_unreferenced(op2_var, dst_size)?;
                        e.vars[op2_var].reg = Some(reg);
                    }
                    Divisor::Variable(op2_var)
                }
                ExpressionType::None => return Err(Diagnostic::internal()),
            };

            if dst_size >= 2 {
                e.save_and_unload_register(Reg::Dx, SaveReason::Inside)?;
                e.zero_register(Reg::Dx, dst_size)?;
            }

            match &divisor {
                Divisor::Variable(var) => e.emit_rm_group_operation(*var, 6, dst_size)?,
                Divisor::InRegister(reg) => match dst_size {
                    1 => {
                        e.buf.code(&[0xF6, xrm(3, 6, reg.code())]);
                    }
                    2 => {
                        e.buf.code(&[0xF7, xrm(3, 6, reg.code())]);
                    }
                    _ => {
                        e.buf.code(&[0x66, 0xF7, xrm(3, 6, reg.code())]);
                    }
                },
            }

            if dst_size == 1 {
                if op == AssignOp::Remainder {
                    // El residuo queda en AH; se baja a AL
                    e.buf.code(&[0x8A, xrm(3, Reg::Ax.code(), Reg::Ax.high8())]);
                }

                // xor ah, ah
                e.buf
                    .code(&[0x32, xrm(3, Reg::Ax.high8(), Reg::Ax.high8())]);

                e.vars[dst_var].reg = Some(Reg::Ax);
            } else {
                e.vars[dst_var].reg = Some(if op == AssignOp::Remainder {
                    Reg::Dx
                } else {
                    Reg::Ax
                });
            }

            Ok(())
        })?;

        self.vars[dst_var].dirty = true;
        self.vars[dst_var].last_used = self.ip_src;
        Ok(())
    }

    fn emit_assign_shift(
        &mut self,
        op: AssignOp,
        dst: &str,
        op1: Operand,
        op2: Operand,
    ) -> Compile<()> {
        let dst_var = self.find_variable(dst)?;
        let dst_size = self.var_size(dst_var);

        match op2.exp_type {
            ExpressionType::Constant => {
                let shift = op2.constant_value();

                if op1.exp_type == ExpressionType::Constant {
                    // Constante desplazada por constante
                    let value = op1.constant_value() as u32;
                    let folded = if op == AssignOp::ShiftLeft {
                        value.wrapping_shl(shift as u32)
                    } else {
                        value.wrapping_shr(shift as u32)
                    } as i32;

                    let reg_dst = self.get_unused_register()?;
                    self.load_constant_to_register(folded, reg_dst, dst_size)?;

                    self.vars[dst_var].reg = Some(reg_dst);
                    self.vars[dst_var].dirty = true;
                    self.vars[dst_var].last_used = self.ip_src;
                    return Ok(());
                }

                self.save_and_unload_register(Reg::Cx, SaveReason::Inside)?;
                self.load_constant_to_register(shift, Reg::Cx, 1)?;
            }
            ExpressionType::Variable => {
                let op2_var = self.find_variable(&op2.value)?;
                self.copy_variable_to_register(op2_var, Reg::Cx, 1)?;
            }
            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        // La cantidad de desplazamiento ya está en CL
        let reg_dst = self.with_suppressed(&[Reg::Cx], |e| {
            let reg_dst = match op1.exp_type {
                ExpressionType::Constant => {
                    let reg = e.get_unused_register()?;
                    e.load_constant_to_register(op1.constant_value(), reg, dst_size)?;
                    reg
                }
                ExpressionType::Variable => {
                    let op1_var = e.find_variable(&op1.value)?;
                    let op1_size = e.var_size(op1_var);

                    if dst_var == op1_var && e.vars[op1_var].reg.is_some() && dst_size <= op1_size {
                        e.vars[op1_var].reg.unwrap()
                    } else {
                        e.load_variable_unreferenced(op1_var, dst_size)?
                    }
                }
                ExpressionType::None => return Err(Diagnostic::internal()),
            };

            let group = if op == AssignOp::ShiftLeft { 4 } else { 5 };
            match dst_size {
                1 => {
                    e.buf.code(&[0xD2, xrm(3, group, reg_dst.code())]);
                }
                2 => {
                    e.buf.code(&[0xD3, xrm(3, group, reg_dst.code())]);
                }
                _ => {
                    e.buf.code(&[0x66, 0xD3, xrm(3, group, reg_dst.code())]);
                }
            }

            Ok(reg_dst)
        })?;

        self.vars[dst_var].reg = Some(reg_dst);
        self.vars[dst_var].dirty = true;
        self.vars[dst_var].last_used = self.ip_src;
        Ok(())
    }

    fn emit_goto(&mut self, target: i32) -> Compile<()> {
        // Las instrucciones "goto" las genera el propio compilador;
        // un salto a sí mismo es imposible
        if target == self.ip_src {
            return Err(Diagnostic::internal());
        }

        // Un salto a la siguiente instrucción se elimina
        if target == self.ip_src + 1 {
            return Ok(());
        }

        self.save_and_unload_all(SaveReason::Before)?;

        let goto_near = if target < self.ip_src {
            let rel = self.ip_src_to_dst[&target] - (self.buf.ip() + 2);
            rel > i8::MIN as i32 && rel < i8::MAX as i32
        } else {
            let rel = (target - self.ip_src) * NEAR_JUMP_THRESHOLD;
            rel > i8::MIN as i32 && rel < i8::MAX as i32
        };

        let patch_offset = if goto_near {
            self.buf.code(&[0xEB, 0]) + 1
        } else {
            self.buf.code(&[0xE9, 0, 0]) + 1
        };

        self.resolve_jump(target, patch_offset, goto_near)
    }

    /// Resuelve un salto relativo: directo si el destino ya se emitió,
    /// con backpatch en caso contrario.
    fn resolve_jump(&mut self, target: i32, patch_offset: usize, near: bool) -> Compile<()> {
        if target < self.ip_src {
            let rel = self.ip_src_to_dst[&target] - self.buf.ip();

            if near {
                if rel < i8::MIN as i32 || rel > i8::MAX as i32 {
                    return Err(compilation(
                        "Compiler cannot generate that high relative address",
                    ));
                }

                self.buf.patch_i8(patch_offset, rel as i8);
            } else {
                self.buf.patch_i16(patch_offset, rel as i16);
            }
        } else {
            self.fixups.push(Fixup {
                kind: if near { FixupKind::Rel8 } else { FixupKind::Rel16 },
                target: FixupTarget::Ip(target),
                offset: patch_offset,
                ip: self.buf.ip(),
            });
        }

        Ok(())
    }

    fn emit_goto_label(&mut self, label: &str) -> Compile<()> {
        let known = self
            .labels
            .iter()
            .find(|l| l.name == label)
            .map(|l| l.ip_dst);

        self.save_and_unload_all(SaveReason::Before)?;

        let goto_near = match known {
            Some(ip_dst) => {
                let rel = ip_dst - (self.buf.ip() + 2);
                rel > i8::MIN as i32 && rel < i8::MAX as i32
            }
            // Sin estimación posible para etiquetas por nombre
            None => false,
        };

        let patch_offset = if goto_near {
            self.buf.code(&[0xEB, 0]) + 1
        } else {
            self.buf.code(&[0xE9, 0, 0]) + 1
        };

        match known {
            Some(ip_dst) => {
                let rel = ip_dst - self.buf.ip();
                if goto_near {
                    if rel < i8::MIN as i32 || rel > i8::MAX as i32 {
                        return Err(compilation(
                            "Compiler cannot generate that high relative address",
                        ));
                    }

                    self.buf.patch_i8(patch_offset, rel as i8);
                } else {
                    self.buf.patch_i16(patch_offset, rel as i16);
                }
            }
            None => {
                self.fixups.push(Fixup {
                    kind: if goto_near { FixupKind::Rel8 } else { FixupKind::Rel16 },
                    target: FixupTarget::Label(label.to_string()),
                    offset: patch_offset,
                    ip: self.buf.ip(),
                });
            }
        }

        Ok(())
    }

    fn emit_if(&mut self, op: CompareOp, op1: Operand, op2: Operand, target: i32) -> Compile<()> {
        if target == self.ip_src {
            return Err(Diagnostic::internal());
        }

        if target == self.ip_src + 1 {
            return Ok(());
        }

        self.save_and_unload_all(SaveReason::Before)?;

        let goto_near = if target < self.ip_src {
            let rel = self.ip_src_to_dst[&target] - (self.buf.ip() + NEAR_JUMP_THRESHOLD);
            rel > i8::MIN as i32 && rel < i8::MAX as i32
        } else {
            let rel = (target - self.ip_src) * NEAR_JUMP_THRESHOLD;
            rel > i8::MIN as i32 && rel < i8::MAX as i32
        };

        // La constante debe ser el segundo operando
        let (op, op1, op2) = if op1.exp_type == ExpressionType::Constant {
            (op.swapped(), op2, op1)
        } else {
            (op, op1, op2)
        };

        let strings =
            op1.typ.base == BaseType::String || op2.typ.base == BaseType::String;

        let patch_offset = if strings {
            self.emit_if_strings(op, &op1, &op2, goto_near)?
        } else {
            match op {
                CompareOp::LogOr | CompareOp::LogAnd => {
                    self.emit_if_or_and(op, &op1, &op2, goto_near)?
                }
                _ => self.emit_if_arithmetic(op, &op1, &op2, goto_near)?,
            }
        };

        match patch_offset {
            Some(patch_offset) => self.resolve_jump(target, patch_offset, goto_near),
            None => Ok(()),
        }
    }

    fn emit_if_or_and(
        &mut self,
        op: CompareOp,
        op1: &Operand,
        op2: &Operand,
        goto_near: bool,
    ) -> Compile<Option<usize>> {
        match op2.exp_type {
            ExpressionType::Constant => match op1.exp_type {
                ExpressionType::Constant => {
                    let value1 = op1.constant_value();
                    let value2 = op2.constant_value();

                    if op.constexpr(value1, value2) {
                        return Ok(Some(self.emit_unconditional(goto_near)));
                    }

                    return Ok(None);
                }
                ExpressionType::Variable => {
                    let op1_var = self.find_variable(&op1.value)?;
                    let op1_size = self.var_size(op1_var);
                    let value = op2.constant_value();

                    let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                    let group = if op == CompareOp::LogOr { 1 } else { 4 };
                    match op1_size {
                        1 => {
                            self.buf
                                .code(&[0x80, xrm(3, group, reg_dst.code()), value as u8]);
                        }
                        2 => {
                            self.buf.code(&[
                                0x81,
                                xrm(3, group, reg_dst.code()),
                                value as u8,
                                (value >> 8) as u8,
                            ]);
                        }
                        _ => {
                            self.buf.code(&[
                                0x66,
                                0x81,
                                xrm(3, group, reg_dst.code()),
                                value as u8,
                                (value >> 8) as u8,
                                (value >> 16) as u8,
                                (value >> 24) as u8,
                            ]);
                        }
                    }
                }
                ExpressionType::None => return Err(Diagnostic::internal()),
            },

            ExpressionType::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                let op2_var = self.find_variable(&op2.value)?;

                // Si el segundo operando ya está en registro, se
                // intercambian; la operación es conmutativa
                let (op1_var, op2_var) = if self.vars[op2_var].reg.is_some() {
                    (op2_var, op1_var)
                } else {
                    (op1_var, op2_var)
                };

                let op1_size = self.var_size(op1_var);
                let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                let opcode8 = if op == CompareOp::LogOr { 0x0A } else { 0x22 };
                let opcode16 = if op == CompareOp::LogOr { 0x0B } else { 0x23 };
                self.emit_rm_operation(op2_var, reg_dst, op1_size, opcode8, opcode16)?;
            }

            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        // jnz al destino
        let patch_offset = if goto_near {
            self.buf.code(&[0x75, 0]) + 1
        } else {
            self.buf.code(&[0x0F, 0x85, 0, 0]) + 2
        };

        Ok(Some(patch_offset))
    }

    fn emit_if_arithmetic(
        &mut self,
        op: CompareOp,
        op1: &Operand,
        op2: &Operand,
        goto_near: bool,
    ) -> Compile<Option<usize>> {
        let mut op = op;

        match op2.exp_type {
            ExpressionType::Constant => match op1.exp_type {
                ExpressionType::Constant => {
                    let value1 = op1.constant_value();
                    let value2 = op2.constant_value();

                    if op.constexpr(value1, value2) {
                        return Ok(Some(self.emit_unconditional(goto_near)));
                    }

                    return Ok(None);
                }
                ExpressionType::Variable => {
                    let op1_var = self.find_variable(&op1.value)?;
                    let op1_size = self.var_size(op1_var);
                    let value = op2.constant_value();

                    let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                    match op1_size {
                        1 => {
                            self.buf
                                .code(&[0x80, xrm(3, 7, reg_dst.code()), value as u8]);
                        }
                        2 => {
                            self.buf.code(&[
                                0x81,
                                xrm(3, 7, reg_dst.code()),
                                value as u8,
                                (value >> 8) as u8,
                            ]);
                        }
                        _ => {
                            self.buf.code(&[
                                0x66,
                                0x81,
                                xrm(3, 7, reg_dst.code()),
                                value as u8,
                                (value >> 8) as u8,
                                (value >> 16) as u8,
                                (value >> 24) as u8,
                            ]);
                        }
                    }
                }
                ExpressionType::None => return Err(Diagnostic::internal()),
            },

            ExpressionType::Variable => {
                let op1_var = self.find_variable(&op1.value)?;
                let op2_var = self.find_variable(&op2.value)?;

                // Uno de los dos tiene que estar en registro; si es el
                // segundo, la comparación se invierte
                let (op1_var, op2_var) = if self.vars[op2_var].reg.is_some() {
                    op = op.swapped();
                    (op2_var, op1_var)
                } else {
                    (op1_var, op2_var)
                };

                let op1_size = self.var_size(op1_var);
                let reg_dst = self.load_variable_unreferenced(op1_var, op1_size)?;

                if self.var_size(op2_var) < op1_size {
                    self.with_suppressed(&[reg_dst], |e| {
                        let reg = e.load_variable_unreferenced(op2_var, op1_size)?;
                        e.vars[op2_var].reg = Some(reg);
                        Ok(())
                    })?;
                }

                self.emit_rm_operation(op2_var, reg_dst, op1_size, 0x3A, 0x3B)?;
            }

            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        let opcode = match op {
            CompareOp::Equal => 0x74,          // jz
            CompareOp::NotEqual => 0x75,       // jnz
            CompareOp::Greater => 0x77,        // jnbe
            CompareOp::Less => 0x72,           // jb
            CompareOp::GreaterOrEqual => 0x73, // jnb
            CompareOp::LessOrEqual => 0x76,    // jbe
            _ => return Err(Diagnostic::internal()),
        };

        let patch_offset = if goto_near {
            self.buf.code(&[opcode, 0]) + 1
        } else {
            self.buf.code(&[0x0F, opcode + 0x10, 0, 0]) + 2
        };

        Ok(Some(patch_offset))
    }

    fn emit_if_strings(
        &mut self,
        op: CompareOp,
        op1: &Operand,
        op2: &Operand,
        goto_near: bool,
    ) -> Compile<Option<usize>> {
        if op1.typ != op2.typ {
            return Err(Diagnostic::internal());
        }

        if op1.exp_type == ExpressionType::Constant {
            // Comparación de literales en tiempo de compilación
            let mut result = op1.value == op2.value;
            match op {
                CompareOp::Equal => {}
                CompareOp::NotEqual => result = !result,
                _ => return Err(Diagnostic::internal()),
            }

            if result {
                return Ok(Some(self.emit_unconditional(goto_near)));
            }

            return Ok(None);
        }

        if op2.exp_type == ExpressionType::Constant {
            let offset = self.buf.code(&[0x68, 0, 0]);
            self.fixup_string(offset + 1, &op2.value);
        } else {
            let op2_var = self.find_variable(&op2.value)?;
            self.push_variable_to_stack(op2_var, 2)?;
        }

        let op1_var = self.find_variable(&op1.value)?;
        self.push_variable_to_stack(op1_var, 2)?;

        // La comparación en tiempo de ejecución referencia a la rutina
        // compartida
        for index in 0..self.symbols.len() {
            let symbol = self.symbols.get(index);
            if symbol.typ.base == BaseType::SharedFunction && symbol.name == "#StringsEqual" {
                self.symbols.get_mut(index).ref_count += 1;
                break;
            }
        }

        let offset = self.buf.code(&[0xE8, 0, 0]);
        self.fixups.push(Fixup {
            kind: FixupKind::Rel16,
            target: FixupTarget::Function("#StringsEqual".to_string()),
            offset: offset + 1,
            ip: self.buf.ip(),
        });

        // or al, al
        self.buf
            .code(&[0x08, xrm(3, Reg::Ax.code(), Reg::Ax.code())]);

        let opcode = match op {
            CompareOp::NotEqual => 0x74, // jz
            CompareOp::Equal => 0x75,    // jnz
            _ => return Err(Diagnostic::internal()),
        };

        let patch_offset = if goto_near {
            self.buf.code(&[opcode, 0]) + 1
        } else {
            self.buf.code(&[0x0F, opcode + 0x10, 0, 0]) + 2
        };

        Ok(Some(patch_offset))
    }

    /// `jmp` incondicional con hueco pendiente; retorna el offset del
    /// hueco.
    fn emit_unconditional(&mut self, goto_near: bool) -> usize {
        if goto_near {
            self.buf.code(&[0xEB, 0]) + 1
        } else {
            self.buf.code(&[0xE9, 0, 0]) + 1
        }
    }

    fn emit_call(&mut self, target: &str, return_symbol: Option<&str>) -> Compile<()> {
        let target_index = self
            .symbols
            .iter()
            .position(|s| s.typ.is_callable() && s.name == target)
            .ok_or_else(Diagnostic::internal)?;

        let parameter_count = self.symbols.get(target_index).parameter;
        if self.call_parameters.len() < parameter_count as usize {
            return Err(Diagnostic::internal());
        }

        // Los parámetros se empujan de derecha a izquierda
        for parameter in (1..=parameter_count).rev() {
            let push_ip = self
                .call_parameters
                .pop()
                .ok_or_else(Diagnostic::internal)?;

            let operand = match &self.stream[push_ip] {
                Instruction::Push { operand } => operand.clone(),
                _ => return Err(Diagnostic::internal()),
            };

            let formal = self
                .symbols
                .iter()
                .position(|s| {
                    s.parameter == parameter && s.parent.as_deref() == Some(target)
                })
                .ok_or_else(Diagnostic::internal)?;
            let formal_type = self.symbols.get(formal).typ;

            match operand.exp_type {
                ExpressionType::Constant => match formal_type.base {
                    _ if formal_type.pointer > 0 => {
                        // Puntero constante (null)
                        let value = parse_constant(&operand.value);
                        self.buf.code(&[0x68, value as u8, (value >> 8) as u8]);
                    }
                    BaseType::Bool | BaseType::Uint8 => {
                        let value = parse_constant(&operand.value);
                        self.buf.code(&[0x6A, value as u8]);
                    }
                    BaseType::Uint16 => {
                        let value = parse_constant(&operand.value);
                        self.buf.code(&[0x68, value as u8, (value >> 8) as u8]);
                    }
                    BaseType::Uint32 => {
                        let value = parse_constant(&operand.value);
                        self.buf.code(&[
                            0x66,
                            0x68,
                            value as u8,
                            (value >> 8) as u8,
                            (value >> 16) as u8,
                            (value >> 24) as u8,
                        ]);
                    }
                    BaseType::String => {
                        let offset = self.buf.code(&[0x68, 0, 0]);
                        self.fixup_string(offset + 1, &operand.value);
                    }
                    _ => return Err(Diagnostic::internal()),
                },

                ExpressionType::Variable => {
                    let var = self.find_variable(&operand.value)?;
                    self.push_variable_to_stack(var, size_of(formal_type))?;
                }

                ExpressionType::None => return Err(Diagnostic::internal()),
            }
        }

        // Convención de llamada con estado de registros vacío
        self.save_and_unload_all(SaveReason::Inside)?;

        let offset = self.buf.code(&[0xE8, 0, 0]);
        let resolved = self
            .functions
            .iter()
            .find(|f| f.name == target)
            .map(|f| f.ip_dst);

        match resolved {
            Some(ip_dst) => {
                self.buf.patch_i16(offset + 1, (ip_dst - self.buf.ip()) as i16);
            }
            None => {
                self.fixups.push(Fixup {
                    kind: FixupKind::Rel16,
                    target: FixupTarget::Function(target.to_string()),
                    offset: offset + 1,
                    ip: self.buf.ip(),
                });
            }
        }

        let return_type = self.symbols.get(target_index).return_type;
        if return_type != VOID {
            // El valor de retorno llega en AX
            let name = return_symbol.ok_or_else(Diagnostic::internal)?;
            let ret = self.find_variable(name)?;
            self.vars[ret].reg = Some(Reg::Ax);
            self.vars[ret].dirty = true;
            self.vars[ret].last_used = self.ip_src;
        }

        Ok(())
    }

    fn emit_return(&mut self, operand: Option<&Operand>) -> Compile<()> {
        self.was_return = true;

        let parent = self.parent.ok_or_else(Diagnostic::internal)?;
        let (parent_name, return_type, is_entry_point) = {
            let symbol = self.symbols.get(parent);
            (
                symbol.name.clone(),
                symbol.return_type,
                symbol.typ.base == BaseType::EntryPoint,
            )
        };

        let operand_type = operand.map(|op| op.typ).unwrap_or(VOID);
        let compatible = (operand.is_none() && return_type == VOID)
            || operand_type == return_type
            || crate::sym::largest_arithmetic_type(operand_type, return_type).base
                != BaseType::Unknown;

        if !compatible {
            return Err(crate::error::compilation(format!(
                "All returns in function \"{}\" must return \"{}\" value, found \"{}\" instead",
                parent_name, return_type, operand_type
            )));
        }

        self.flush_dirty_statics()?;

        if is_entry_point {
            // El punto de entrada termina llamando al DOS con el
            // código de salida en AL
            let operand = operand.ok_or_else(Diagnostic::internal)?;
            match operand.exp_type {
                ExpressionType::Constant => {
                    self.buf.code(&[0xB0, operand.constant_value() as u8]);
                }
                ExpressionType::Variable => {
                    let src = self.find_variable(&operand.value)?;
                    let is_local = self.symbols.get(self.vars[src].sym).parent.is_some();

                    match self.vars[src].reg {
                        Some(Reg::Ax) => {
                            // El valor ya está en su lugar
                        }
                        Some(reg) => {
                            self.buf
                                .code(&[0x8A, xrm(3, Reg::Ax.code(), reg.code())]);
                        }
                        None if !is_local => {
                            let offset =
                                self.buf.code(&[0x8A, xrm(0, Reg::Ax.code(), 6), 0, 0]);
                            self.fixup_static(offset + 2, src);
                        }
                        None => {
                            let offset = self.buf.code(&[0x8A, xrm(1, Reg::Ax.code(), 6), 0]);
                            self.fixup_local(offset + 2, src);
                        }
                    }
                }
                ExpressionType::None => return Err(Diagnostic::internal()),
            }

            self.buf.asm_int_ah(0x21, 0x4C);
            return Ok(());
        }

        // Función común: valor de retorno en AX, convención de
        // limpieza por el llamado
        if return_type != VOID {
            let operand = operand.ok_or_else(Diagnostic::internal)?;
            let dst_size = size_of(return_type);

            match operand.exp_type {
                ExpressionType::Constant => {
                    self.load_constant_to_register(operand.constant_value(), Reg::Ax, dst_size)?;
                }
                ExpressionType::Variable => {
                    let src = self.find_variable(&operand.value)?;
                    self.copy_variable_to_register(src, Reg::Ax, dst_size)?;
                }
                ExpressionType::None => return Err(Diagnostic::internal()),
            }
        }

        let has_parameters = self.symbols.get(parent).parameter > 0;
        if has_parameters {
            let mut stack_param_size: u16 = 0;
            for symbol in self.symbols.iter() {
                if symbol.parameter != 0 && symbol.parent.as_deref() == Some(parent_name.as_str())
                {
                    stack_param_size += size_of(symbol.typ).max(2) as u16;
                }
            }

            self.buf.asm_proc_leave(stack_param_size, true);
        } else {
            self.buf.asm_proc_leave(0, false);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Datos finales

    /// Emite la tabla de cadenas deduplicadas y asigna direcciones a
    /// la región estática (que no ocupa bytes en el archivo).
    fn emit_static_data(&mut self) -> Compile<()> {
        let strings = std::mem::take(&mut self.strings);
        for string in &strings {
            let ip_dst = self.buf.ip();
            self.backpatch_labels(string, ip_dst, |t| matches!(t, FixupTarget::Str(_)))?;

            let mut bytes: Vec<u8> = string.bytes().collect();
            bytes.push(0);
            self.buf.code(&bytes);
        }

        for index in 0..self.vars.len() {
            let (is_static, size, name) = {
                let symbol = self.symbols.get(self.vars[index].sym);
                let size = if symbol.size > 0 {
                    symbol.size * size_of(symbol.typ.dereference())
                } else {
                    size_of(symbol.typ)
                };

                (symbol.parent.is_none(), size, symbol.name.clone())
            };

            if !is_static {
                continue;
            }

            let address = self.buf.ip() + self.static_size;
            self.backpatch_labels(&name, address, |t| matches!(t, FixupTarget::Static(_)))?;
            self.static_size += size;
        }

        Ok(())
    }

    fn finalize(&mut self, stack_size: u32) -> Compile<()> {
        // El IP inicial apunta al prólogo del punto de entrada
        let entry_ip = self.entry_ip_dst.ok_or_else(Diagnostic::internal)? as u16;

        exe::finalize_header(&mut self.buf, self.static_size, stack_size, entry_ip);
        Ok(())
    }

    /// Verifica que no quede ningún hueco pendiente y entrega la
    /// imagen final.
    fn save(self) -> Compile<Vec<u8>> {
        for fixup in &self.fixups {
            match &fixup.target {
                FixupTarget::Function(name) => {
                    return Err(Diagnostic::new(
                        crate::error::Stage::Statement,
                        format!("Function \"{}\" could not be resolved", name),
                        None,
                    ));
                }
                FixupTarget::Str(name) => {
                    return Err(Diagnostic::new(
                        crate::error::Stage::Statement,
                        format!("String \"{}\" could not be resolved", name),
                        None,
                    ));
                }
                _ => return Err(Diagnostic::internal()),
            }
        }

        Ok(self.buf.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::{Builder, ENTRY_POINT_NAME};
    use crate::source::Position;
    use crate::sym::{BOOL, UINT8};

    /// Un programa mínimo construido a mano que ejercita la forma
    /// estructural `If LogOr/LogAnd` de la traducción condicional.
    #[test]
    fn logical_if_forms_are_translated() {
        let mut builder = Builder::new();
        let position = Position::default();

        builder
            .to_declaration(BOOL, 0, "a", ExpressionType::Variable, position)
            .unwrap();

        // if (a || 1) {} representado directamente en la IR
        builder.emit(Instruction::Assign {
            op: AssignOp::None,
            dst: "a".to_string(),
            dst_index: None,
            op1: Operand::constant("1", BOOL),
            op2: None,
        });
        builder.emit(Instruction::If {
            op: CompareOp::LogOr,
            op1: Operand::variable("a", BOOL),
            op2: Operand::constant("1", BOOL),
            target: 4,
        });
        builder.emit(Instruction::Nop);
        builder.emit(Instruction::Return {
            operand: Some(Operand::constant("0", UINT8)),
        });
        builder
            .add_function(ENTRY_POINT_NAME, UINT8, position)
            .unwrap();
        builder.postprocess().unwrap();

        let mut program = builder.finish(0);
        let image = emit(&mut program).unwrap();

        assert_eq!(&image[0..2], b"MZ");
        // La forma or/and genera "or rm8, imm8" (0x80 /1)
        assert!(image
            .windows(2)
            .any(|w| w[0] == 0x80 && (w[1] & 0x38) == 0x08));
    }
}
