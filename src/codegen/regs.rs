//! Asignación de registros con escritura diferida.
//!
//! Cada variable tipada tiene un descriptor que recuerda en qué
//! registro vive, su posición de pila una vez asignada, la última
//! instrucción que la usó y si está sucia (modificada sin escribir a
//! memoria). Un registro contiene a lo sumo una variable viva; cuando
//! no hay registros libres se desaloja la variable usada hace más
//! tiempo. Una variable sucia que no vuelve a referenciarse dentro de
//! su función no se escribe.

use super::{Emitter, FixupKind, FixupTarget};
use crate::codegen::i386::{opr, xrm, Reg};
use crate::error::{Compile, Diagnostic};
use crate::ir::{Instruction, OperandIndex};
use crate::sym::{size_of, size_to_shift, ExpressionType};

/// Descriptor de una variable durante la emisión.
pub(super) struct Var {
    /// Índice del símbolo en la tabla.
    pub sym: usize,

    pub reg: Option<Reg>,

    /// Offset de pila (locales, negativo) o de parámetro (positivo);
    /// se asigna en el epílogo o en el prólogo respectivamente.
    pub location: Option<i32>,

    pub last_used: i32,
    pub dirty: bool,

    /// La variable debe escribirse siempre; su dirección fue tomada.
    pub force_save: bool,
}

/// Motivo de una escritura a memoria; decide desde dónde se busca la
/// siguiente referencia a la variable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum SaveReason {
    /// Se guarda si se referencia en esta instrucción o después.
    Before,

    /// Se guarda si se referencia después de esta instrucción.
    Inside,

    /// Se guarda siempre.
    Force,
}

impl<'a> Emitter<'a> {
    /// Llena la lista de descriptores con todos los símbolos tipados.
    pub(super) fn create_variable_list(&mut self) {
        for index in 0..self.symbols.len() {
            if self.symbols.get(index).typ.is_valid() {
                self.vars.push(Var {
                    sym: index,
                    reg: None,
                    location: None,
                    last_used: 0,
                    dirty: false,
                    force_save: false,
                });
            }
        }
    }

    fn parent_name(&self) -> Option<&str> {
        self.parent.map(|p| self.symbols.get(p).name.as_str())
    }

    /// Una variable participa de la asignación de registros si es
    /// estática o pertenece a la función en curso.
    fn var_in_scope(&self, var: usize) -> bool {
        let symbol = self.symbols.get(self.vars[var].sym);
        match (&symbol.parent, self.parent_name()) {
            (None, _) => true,
            (Some(parent), Some(current)) => parent == current,
            (Some(_), None) => false,
        }
    }

    pub(super) fn var_size(&self, var: usize) -> i32 {
        size_of(self.symbols.get(self.vars[var].sym).typ)
    }

    /// Busca una variable por nombre: primero las locales de la
    /// función en curso, luego las estáticas.
    pub(super) fn find_variable(&self, name: &str) -> Compile<usize> {
        let current = self.parent_name();

        for (index, var) in self.vars.iter().enumerate() {
            let symbol = self.symbols.get(var.sym);
            if symbol.parent.as_deref() == current && current.is_some() && symbol.name == name {
                return Ok(index);
            }
        }

        for (index, var) in self.vars.iter().enumerate() {
            let symbol = self.symbols.get(var.sym);
            if symbol.parent.is_none() && symbol.name == name {
                return Ok(index);
            }
        }

        Err(Diagnostic::internal())
    }

    /// Registro libre; si todos están ocupados se desaloja la variable
    /// menos recientemente usada, escribiéndola si está sucia.
    pub(super) fn get_unused_register(&mut self) -> Compile<Reg> {
        let mut used: [Option<usize>; 4] = [None; 4];
        for index in 0..self.vars.len() {
            if let Some(reg) = self.vars[index].reg {
                if self.var_in_scope(index) {
                    used[reg.code() as usize] = Some(index);
                }
            }
        }

        let mut victim: Option<usize> = None;
        for reg in Reg::ALLOCATABLE {
            if self.suppressed.contains(&reg) {
                continue;
            }

            match used[reg.code() as usize] {
                None => return Ok(reg),
                Some(index) => {
                    let better = match victim {
                        Some(current) => {
                            self.vars[current].last_used > self.vars[index].last_used
                        }
                        None => true,
                    };
                    if better {
                        victim = Some(index);
                    }
                }
            }
        }

        let victim = victim.ok_or_else(Diagnostic::internal)?;
        let reg = self.vars[victim].reg.ok_or_else(Diagnostic::internal)?;

        self.save_variable(victim, SaveReason::Inside)?;
        self.vars[victim].reg = None;
        self.vars[victim].dirty = false;

        Ok(reg)
    }

    /// Registro libre sin desalojar; `None` si no hay.
    pub(super) fn try_get_unused_register(&self) -> Option<Reg> {
        let mut used = [false; 4];
        for index in 0..self.vars.len() {
            if let Some(reg) = self.vars[index].reg {
                if self.var_in_scope(index) {
                    used[reg.code() as usize] = true;
                }
            }
        }

        Reg::ALLOCATABLE
            .iter()
            .copied()
            .find(|reg| !self.suppressed.contains(reg) && !used[reg.code() as usize])
    }

    /// Ejecuta una operación con registros excluidos de la asignación
    /// automática; la exclusión se libera al terminar.
    pub(super) fn with_suppressed<T, F>(&mut self, regs: &[Reg], body: F) -> Compile<T>
    where
        F: FnOnce(&mut Self) -> Compile<T>,
    {
        for &reg in regs {
            self.suppressed.push(reg);
        }

        let result = body(self);

        for _ in regs {
            self.suppressed.pop();
        }

        result
    }

    /// Determina si la variable vuelve a referenciarse dentro de la
    /// función en curso. Un salto hacia atrás hace el flujo
    /// impredecible: las temporales mueren ahí, el resto se conserva.
    pub(super) fn find_next_variable_reference(&self, var: usize, reason: SaveReason) -> bool {
        let symbol = self.symbols.get(self.vars[var].sym);
        let name = symbol.name.as_str();
        let is_temp = symbol.is_temp;

        let mut ip = self.ip_src;
        match reason {
            SaveReason::Force => return true,
            SaveReason::Inside => ip += 1,
            SaveReason::Before => {}
        }

        let operand_matches = |op: &crate::ir::Operand| {
            (op.exp_type == ExpressionType::Variable && op.value == name)
                || op
                    .index
                    .as_ref()
                    .map_or(false, |index| index.exp_type == ExpressionType::Variable && index.value == name)
        };

        while (ip as usize) < self.stream.len() && ip <= self.parent_end_ip {
            match &self.stream[ip as usize] {
                Instruction::Assign {
                    dst,
                    dst_index,
                    op1,
                    op2,
                    ..
                } => {
                    let dst_matches = dst_index.as_ref().map_or(false, |index| {
                        dst == name
                            || (index.exp_type == ExpressionType::Variable && index.value == name)
                    });

                    if operand_matches(op1)
                        || op2.as_ref().map_or(false, |op| operand_matches(op))
                        || dst_matches
                    {
                        return true;
                    }
                }

                Instruction::If { op: _, op1, op2, target } => {
                    if operand_matches(op1) || operand_matches(op2) {
                        return true;
                    }

                    if *target < self.ip_src {
                        // Salto hacia atrás
                        return !is_temp;
                    }
                }

                Instruction::Goto { target } => {
                    if *target < self.ip_src {
                        return !is_temp;
                    }
                }

                Instruction::GotoLabel { label } => {
                    // Una etiqueta ya definida implica salto hacia atrás
                    if self.labels.iter().any(|l| l.name == *label) {
                        return !is_temp;
                    }
                }

                Instruction::Push { operand } => {
                    if operand.exp_type == ExpressionType::Variable && operand.value == name {
                        return true;
                    }
                }

                Instruction::Return { operand } => {
                    if let Some(op) = operand {
                        if op.exp_type == ExpressionType::Variable && op.value == name {
                            return true;
                        }
                    }
                }

                Instruction::Call { .. } | Instruction::Nop => {}
            }

            ip += 1;
        }

        false
    }

    /// Registra un arreglo a resolver con el offset de pila de una
    /// variable local; si la posición ya se conoce se escribe directo.
    pub(super) fn fixup_local(&mut self, offset: usize, var: usize) {
        match self.vars[var].location {
            Some(location) => self.buf.patch_i8(offset, location as i8),
            None => {
                let sym = self.vars[var].sym;
                let name = self.symbols.get(sym).name.clone();
                self.fixups.push(super::Fixup {
                    kind: FixupKind::Stack8,
                    target: FixupTarget::Local(name),
                    offset,
                    ip: 0,
                });
                self.symbols.get_mut(sym).ref_count += 1;
            }
        }
    }

    /// Registra una dirección absoluta de DS a resolver con la
    /// posición de una variable estática.
    pub(super) fn fixup_static(&mut self, offset: usize, var: usize) {
        let name = self.symbols.get(self.vars[var].sym).name.clone();
        self.fixups.push(super::Fixup {
            kind: FixupKind::DsAbs16,
            target: FixupTarget::Static(name),
            offset,
            ip: 0,
        });
    }

    /// Registra una dirección absoluta de DS a resolver con la
    /// posición de un literal de cadena, deduplicándolo.
    pub(super) fn fixup_string(&mut self, offset: usize, value: &str) {
        if !self.strings.iter().any(|s| s == value) {
            self.strings.push(value.to_string());
        }

        self.fixups.push(super::Fixup {
            kind: FixupKind::DsAbs16,
            target: FixupTarget::Str(value.to_string()),
            offset,
            ip: 0,
        });
    }

    /// Escribe una variable sucia a su almacenamiento. Una local que
    /// no vuelve a usarse se descarta sin escribir.
    pub(super) fn save_variable(&mut self, var: usize, reason: SaveReason) -> Compile<()> {
        let symbol = self.symbols.get(self.vars[var].sym);
        if symbol.size > 0 {
            // El almacenamiento prealocado solo admite acceso indexado
            return Err(Diagnostic::internal());
        }

        if !self.vars[var].dirty {
            return Ok(());
        }

        let var_size = size_of(symbol.typ);
        let is_local = symbol.parent.is_some();
        let reg = self.vars[var].reg.ok_or_else(Diagnostic::internal)?;

        if is_local {
            if !self.vars[var].force_save && !self.find_next_variable_reference(var, reason) {
                // La variable ya no se necesita
                return Ok(());
            }

            match var_size {
                1 => {
                    let offset = self.buf.code(&[0x88, xrm(1, reg.code(), 6), 0]);
                    self.fixup_local(offset + 2, var);
                }
                2 => {
                    let offset = self.buf.code(&[0x89, xrm(1, reg.code(), 6), 0]);
                    self.fixup_local(offset + 2, var);
                }
                _ => {
                    let offset = self.buf.code(&[0x66, 0x89, xrm(1, reg.code(), 6), 0]);
                    self.fixup_local(offset + 3, var);
                }
            }
        } else {
            match var_size {
                1 => {
                    let offset = self.buf.code(&[0x88, xrm(0, reg.code(), 6), 0, 0]);
                    self.fixup_static(offset + 2, var);
                }
                2 => {
                    let offset = self.buf.code(&[0x89, xrm(0, reg.code(), 6), 0, 0]);
                    self.fixup_static(offset + 2, var);
                }
                _ => {
                    let offset = self.buf.code(&[0x66, 0x89, xrm(0, reg.code(), 6), 0, 0]);
                    self.fixup_static(offset + 3, var);
                }
            }
        }

        self.vars[var].dirty = false;
        Ok(())
    }

    /// Escribe y desasocia la variable que ocupa un registro.
    pub(super) fn save_and_unload_register(&mut self, reg: Reg, reason: SaveReason) -> Compile<()> {
        for index in 0..self.vars.len() {
            if self.vars[index].reg == Some(reg) && self.var_in_scope(index) {
                self.save_variable(index, reason)?;
                self.vars[index].reg = None;
                break;
            }
        }

        Ok(())
    }

    /// Escribe toda variable sucia y libera todos los registros.
    pub(super) fn save_and_unload_all(&mut self, reason: SaveReason) -> Compile<()> {
        for index in 0..self.vars.len() {
            if self.vars[index].reg.is_some() && self.var_in_scope(index) {
                self.save_variable(index, reason)?;
                self.vars[index].reg = None;
            }
        }

        Ok(())
    }

    /// Escribe las estáticas sucias sin liberar sus registros; se usa
    /// antes de los epílogos de retorno.
    pub(super) fn flush_dirty_statics(&mut self) -> Compile<()> {
        for index in 0..self.vars.len() {
            if self.vars[index].reg.is_some()
                && self.vars[index].dirty
                && self.symbols.get(self.vars[index].sym).parent.is_none()
            {
                self.save_variable(index, SaveReason::Force)?;
            }
        }

        Ok(())
    }

    /// Rompe la asociación variable-registro de un registro que va a
    /// sobreescribirse; la variable debe estar limpia.
    pub(super) fn mark_register_discarded(&mut self, reg: Reg) -> Compile<()> {
        if self.parent.is_none() {
            return Ok(());
        }

        for index in 0..self.vars.len() {
            if self.vars[index].reg == Some(reg) && self.var_in_scope(index) {
                if self.vars[index].dirty {
                    return Err(Diagnostic::internal());
                }

                self.vars[index].reg = None;
                break;
            }
        }

        Ok(())
    }

    /// Empuja el valor de una variable a la pila de parámetros con el
    /// tamaño del parámetro formal (mínimo 2 bytes).
    pub(super) fn push_variable_to_stack(&mut self, var: usize, param_size: i32) -> Compile<()> {
        let var_size = self.var_size(var);

        if var_size < param_size {
            // La variable necesita expandirse
            let reg = self.load_variable_unreferenced(var, param_size)?;

            match param_size {
                2 => {
                    self.buf.code(&[opr(0x50, reg)]);
                }
                4 => {
                    self.buf.code(&[0x66, opr(0x50, reg)]);
                }
                _ => return Err(Diagnostic::internal()),
            }
        } else if let Some(reg) = self.vars[var].reg {
            match param_size {
                1 => {
                    // La mitad alta se limpia antes de empujar
                    self.buf.code(&[
                        0x32,
                        xrm(3, reg.high8(), reg.high8()),
                        opr(0x50, reg),
                    ]);
                }
                2 => {
                    self.buf.code(&[opr(0x50, reg)]);
                }
                4 => {
                    self.buf.code(&[0x66, opr(0x50, reg)]);
                }
                _ => return Err(Diagnostic::internal()),
            }
        } else {
            let is_local = self.symbols.get(self.vars[var].sym).parent.is_some();

            match param_size {
                1 => {
                    let reg_temp = self.get_unused_register()?;

                    if is_local {
                        let offset = self.buf.code(&[0x0F, 0xB6, xrm(1, reg_temp.code(), 6), 0]);
                        self.fixup_local(offset + 3, var);
                    } else {
                        let offset = self.buf.code(&[0x0F, 0xB6, xrm(0, reg_temp.code(), 6), 0, 0]);
                        self.fixup_static(offset + 3, var);
                    }

                    self.buf.code(&[opr(0x50, reg_temp)]);
                }
                2 => {
                    if is_local {
                        let offset = self.buf.code(&[0xFF, xrm(1, 6, 6), 0]);
                        self.fixup_local(offset + 2, var);
                    } else {
                        let offset = self.buf.code(&[0xFF, xrm(0, 6, 6), 0, 0]);
                        self.fixup_static(offset + 2, var);
                    }
                }
                4 => {
                    if is_local {
                        let offset = self.buf.code(&[0x66, 0xFF, xrm(1, 6, 6), 0]);
                        self.fixup_local(offset + 3, var);
                    } else {
                        let offset = self.buf.code(&[0x66, 0xFF, xrm(0, 6, 6), 0, 0]);
                        self.fixup_static(offset + 3, var);
                    }
                }
                _ => return Err(Diagnostic::internal()),
            }
        }

        Ok(())
    }

    /// Carga el valor de una variable en algún registro sin dejarle
    /// la propiedad del mismo.
    pub(super) fn load_variable_unreferenced(
        &mut self,
        var: usize,
        desired_size: i32,
    ) -> Compile<Reg> {
        if self.symbols.get(self.vars[var].sym).size > 0 {
            if desired_size != 2 {
                return Err(Diagnostic::internal());
            }

            return self.load_variable_pointer(var, true);
        }

        let var_size = self.var_size(var);

        let reg_dst = match self.vars[var].reg {
            None => self.get_unused_register()?,
            Some(reg) => {
                if var_size < desired_size {
                    // Si hay un registro libre la expansión es directa
                    self.try_get_unused_register().unwrap_or(reg)
                } else {
                    reg
                }
            }
        };

        self.copy_variable_to_register(var, reg_dst, desired_size)?;
        Ok(reg_dst)
    }

    /// Carga la dirección de una variable: `lea` para locales,
    /// inmediato relativo a DS para estáticas.
    pub(super) fn load_variable_pointer(&mut self, var: usize, force_reference: bool) -> Compile<Reg> {
        let reg_dst = self.get_unused_register()?;

        // El tamaño de puntero es de 16 bits
        if !force_reference && self.symbols.get(self.vars[var].sym).size == 0 {
            return self.load_variable_unreferenced(var, 2);
        }

        if self.symbols.get(self.vars[var].sym).parent.is_some() {
            let offset = self.buf.code(&[0x8D, xrm(1, reg_dst.code(), 6), 0]);
            self.fixup_local(offset + 2, var);
        } else {
            let offset = self.buf.code(&[opr(0xB8, reg_dst), 0, 0]);
            self.fixup_static(offset + 1, var);
        }

        Ok(reg_dst)
    }

    /// Carga `var[index]` en un registro: calcula el offset en SI
    /// (índice por tamaño del elemento), suma la base y lee.
    pub(super) fn load_indexed_variable(
        &mut self,
        var: usize,
        index: &OperandIndex,
        desired_size: i32,
    ) -> Compile<Reg> {
        let symbol = self.symbols.get(self.vars[var].sym);
        if symbol.typ.pointer == 0 {
            return Err(Diagnostic::internal());
        }

        let resolved_size = size_of(symbol.typ.dereference());
        let preallocated = symbol.size > 0;
        let is_local = symbol.parent.is_some();

        self.load_index_offset(index, resolved_size, Reg::Si)?;

        if !preallocated {
            if let Some(reg) = self.vars[var].reg {
                // El puntero ya está cargado en un registro
                self.buf.code(&[0x03, xrm(3, Reg::Si.code(), reg.code())]);
            } else if !is_local {
                let offset = self.buf.code(&[0x03, xrm(0, Reg::Si.code(), 6), 0, 0]);
                self.fixup_static(offset + 2, var);
            } else {
                let offset = self.buf.code(&[0x03, xrm(1, Reg::Si.code(), 6), 0]);
                self.fixup_local(offset + 2, var);
            }
        }

        let reg_dst = self.get_unused_register()?;

        // Modos de dirección: [si] para punteros, [si+disp16] para
        // estáticas, [bp+si+disp8] para locales
        match resolved_size {
            1 => {
                if desired_size >= 4 {
                    if !preallocated {
                        self.buf
                            .code(&[0x66, 0x0F, 0xB6, xrm(0, reg_dst.code(), 4)]);
                    } else if !is_local {
                        let offset = self
                            .buf
                            .code(&[0x66, 0x0F, 0xB6, xrm(2, reg_dst.code(), 4), 0, 0]);
                        self.fixup_static(offset + 4, var);
                    } else {
                        let offset = self
                            .buf
                            .code(&[0x66, 0x0F, 0xB6, xrm(1, reg_dst.code(), 2), 0]);
                        self.fixup_local(offset + 4, var);
                    }
                } else if desired_size == 2 {
                    if !preallocated {
                        self.buf.code(&[0x0F, 0xB6, xrm(0, reg_dst.code(), 4)]);
                    } else if !is_local {
                        let offset =
                            self.buf.code(&[0x0F, 0xB6, xrm(2, reg_dst.code(), 4), 0, 0]);
                        self.fixup_static(offset + 3, var);
                    } else {
                        let offset = self.buf.code(&[0x0F, 0xB6, xrm(1, reg_dst.code(), 2), 0]);
                        self.fixup_local(offset + 3, var);
                    }
                } else if !preallocated {
                    self.buf.code(&[0x8A, xrm(0, reg_dst.code(), 4)]);
                } else if !is_local {
                    let offset = self.buf.code(&[0x8A, xrm(2, reg_dst.code(), 4), 0, 0]);
                    self.fixup_static(offset + 2, var);
                } else {
                    let offset = self.buf.code(&[0x8A, xrm(1, reg_dst.code(), 2), 0]);
                    self.fixup_local(offset + 2, var);
                }
            }
            2 => {
                if desired_size >= 4 {
                    if !preallocated {
                        self.buf.code(&[0x0F, 0xB7, xrm(0, reg_dst.code(), 4)]);
                    } else if !is_local {
                        let offset =
                            self.buf.code(&[0x0F, 0xB7, xrm(2, reg_dst.code(), 4), 0, 0]);
                        self.fixup_static(offset + 3, var);
                    } else {
                        let offset = self.buf.code(&[0x0F, 0xB7, xrm(1, reg_dst.code(), 2), 0]);
                        self.fixup_local(offset + 3, var);
                    }
                } else if !preallocated {
                    self.buf.code(&[0x8B, xrm(0, reg_dst.code(), 4)]);
                } else if !is_local {
                    let offset = self.buf.code(&[0x8B, xrm(2, reg_dst.code(), 4), 0, 0]);
                    self.fixup_static(offset + 2, var);
                } else {
                    let offset = self.buf.code(&[0x8B, xrm(1, reg_dst.code(), 2), 0]);
                    self.fixup_local(offset + 2, var);
                }
            }
            _ => {
                if !preallocated {
                    self.buf.code(&[0x66, 0x8B, xrm(0, reg_dst.code(), 4)]);
                } else if !is_local {
                    let offset = self.buf.code(&[0x66, 0x8B, xrm(2, reg_dst.code(), 4), 0, 0]);
                    self.fixup_static(offset + 3, var);
                } else {
                    let offset = self.buf.code(&[0x66, 0x8B, xrm(1, reg_dst.code(), 2), 0]);
                    self.fixup_local(offset + 3, var);
                }
            }
        }

        Ok(reg_dst)
    }

    /// Guarda un registro en `var[index]`; espejo del cargador, con
    /// el offset calculado en DI.
    pub(super) fn save_indexed_variable(
        &mut self,
        var: usize,
        index: &OperandIndex,
        reg_src: Reg,
    ) -> Compile<()> {
        let symbol = self.symbols.get(self.vars[var].sym);
        if symbol.typ.pointer == 0 {
            return Err(Diagnostic::internal());
        }

        let resolved_size = size_of(symbol.typ.dereference());
        let preallocated = symbol.size > 0;
        let is_local = symbol.parent.is_some();

        self.load_index_offset(index, resolved_size, Reg::Di)?;

        if !preallocated {
            if let Some(reg) = self.vars[var].reg {
                self.buf.code(&[0x03, xrm(3, Reg::Di.code(), reg.code())]);
            } else if !is_local {
                let offset = self.buf.code(&[0x03, xrm(0, Reg::Di.code(), 6), 0, 0]);
                self.fixup_static(offset + 2, var);
            } else {
                let offset = self.buf.code(&[0x03, xrm(1, Reg::Di.code(), 6), 0]);
                self.fixup_local(offset + 2, var);
            }
        }

        let opcode = match resolved_size {
            1 => 0x88,
            _ => 0x89,
        };
        let prefix = resolved_size == 4;

        if !preallocated {
            if prefix {
                self.buf.code(&[0x66, opcode, xrm(0, reg_src.code(), 5)]);
            } else {
                self.buf.code(&[opcode, xrm(0, reg_src.code(), 5)]);
            }
        } else if !is_local {
            if prefix {
                let offset = self.buf.code(&[0x66, opcode, xrm(2, reg_src.code(), 5), 0, 0]);
                self.fixup_static(offset + 3, var);
            } else {
                let offset = self.buf.code(&[opcode, xrm(2, reg_src.code(), 5), 0, 0]);
                self.fixup_static(offset + 2, var);
            }
        } else if prefix {
            let offset = self.buf.code(&[0x66, opcode, xrm(1, reg_src.code(), 3), 0]);
            self.fixup_local(offset + 3, var);
        } else {
            let offset = self.buf.code(&[opcode, xrm(1, reg_src.code(), 3), 0]);
            self.fixup_local(offset + 2, var);
        }

        Ok(())
    }

    /// Calcula índice por tamaño del elemento en el registro de
    /// dirección, con shift cuando el tamaño es potencia de dos.
    fn load_index_offset(
        &mut self,
        index: &OperandIndex,
        resolved_size: i32,
        reg: Reg,
    ) -> Compile<()> {
        match index.exp_type {
            ExpressionType::Constant => {
                let value = crate::ir::parse_constant(&index.value) * resolved_size;
                self.load_constant_to_register(value, reg, 2)?;
            }
            ExpressionType::Variable => {
                let index_var = self.find_variable(&index.value)?;
                self.copy_variable_to_register(index_var, reg, 2)?;

                let shift = size_to_shift(resolved_size);
                if shift > 0 {
                    self.buf.code(&[0xC1, xrm(3, 4, reg.code()), shift]);
                }
            }
            ExpressionType::None => return Err(Diagnostic::internal()),
        }

        Ok(())
    }

    /// Copia el valor de una variable a un registro concreto,
    /// retirándole la propiedad del registro si coincidía.
    pub(super) fn copy_variable_to_register(
        &mut self,
        var: usize,
        reg_dst: Reg,
        desired_size: i32,
    ) -> Compile<()> {
        if self.symbols.get(self.vars[var].sym).size > 0 {
            return Err(Diagnostic::internal());
        }

        let desired_size = desired_size.min(4);
        let var_size = self.var_size(var);

        if let Some(reg_src) = self.vars[var].reg {
            if reg_src == reg_dst && var_size >= desired_size {
                // La variable ya está donde y como se necesita
                self.save_variable(var, SaveReason::Inside)?;
                self.vars[var].reg = None;
                return Ok(());
            }

            if reg_src == reg_dst {
                self.save_variable(var, SaveReason::Inside)?;
                self.vars[var].reg = None;
            } else {
                self.save_and_unload_register(reg_dst, SaveReason::Inside)?;
            }

            match var_size {
                1 => {
                    if desired_size == 4 {
                        self.buf
                            .code(&[0x66, 0x0F, 0xB6, xrm(3, reg_dst.code(), reg_src.code())]);
                    } else if desired_size == 2 {
                        self.buf
                            .code(&[0x0F, 0xB6, xrm(3, reg_dst.code(), reg_src.code())]);
                    } else {
                        self.buf.code(&[0x8A, xrm(3, reg_dst.code(), reg_src.code())]);
                    }
                }
                2 => {
                    if desired_size == 4 {
                        self.buf
                            .code(&[0x66, 0x0F, 0xB7, xrm(3, reg_dst.code(), reg_src.code())]);
                    } else {
                        self.buf.code(&[0x8B, xrm(3, reg_dst.code(), reg_src.code())]);
                    }
                }
                _ => {
                    self.buf
                        .code(&[0x66, 0x8B, xrm(3, reg_dst.code(), reg_src.code())]);
                }
            }

            return Ok(());
        }

        self.save_and_unload_register(reg_dst, SaveReason::Inside)?;

        let is_local = self.symbols.get(self.vars[var].sym).parent.is_some();

        match var_size {
            1 => {
                if desired_size == 4 {
                    if !is_local {
                        let offset = self
                            .buf
                            .code(&[0x66, 0x0F, 0xB6, xrm(0, reg_dst.code(), 6), 0, 0]);
                        self.fixup_static(offset + 4, var);
                    } else {
                        let offset =
                            self.buf.code(&[0x66, 0x0F, 0xB6, xrm(1, reg_dst.code(), 6), 0]);
                        self.fixup_local(offset + 4, var);
                    }
                } else if desired_size == 2 {
                    if !is_local {
                        let offset = self.buf.code(&[0x0F, 0xB6, xrm(0, reg_dst.code(), 6), 0, 0]);
                        self.fixup_static(offset + 3, var);
                    } else {
                        let offset = self.buf.code(&[0x0F, 0xB6, xrm(1, reg_dst.code(), 6), 0]);
                        self.fixup_local(offset + 3, var);
                    }
                } else if !is_local {
                    let offset = self.buf.code(&[0x8A, xrm(0, reg_dst.code(), 6), 0, 0]);
                    self.fixup_static(offset + 2, var);
                } else {
                    let offset = self.buf.code(&[0x8A, xrm(1, reg_dst.code(), 6), 0]);
                    self.fixup_local(offset + 2, var);
                }
            }
            2 => {
                if desired_size == 4 {
                    if !is_local {
                        let offset = self
                            .buf
                            .code(&[0x66, 0x0F, 0xB7, xrm(0, reg_dst.code(), 6), 0, 0]);
                        self.fixup_static(offset + 4, var);
                    } else {
                        let offset =
                            self.buf.code(&[0x66, 0x0F, 0xB7, xrm(1, reg_dst.code(), 6), 0]);
                        self.fixup_local(offset + 4, var);
                    }
                } else if !is_local {
                    let offset = self.buf.code(&[0x8B, xrm(0, reg_dst.code(), 6), 0, 0]);
                    self.fixup_static(offset + 2, var);
                } else {
                    let offset = self.buf.code(&[0x8B, xrm(1, reg_dst.code(), 6), 0]);
                    self.fixup_local(offset + 2, var);
                }
            }
            _ => {
                if !is_local {
                    let offset = self.buf.code(&[0x66, 0x8B, xrm(0, reg_dst.code(), 6), 0, 0]);
                    self.fixup_static(offset + 3, var);
                } else {
                    let offset = self.buf.code(&[0x66, 0x8B, xrm(1, reg_dst.code(), 6), 0]);
                    self.fixup_local(offset + 3, var);
                }
            }
        }

        Ok(())
    }

    /// Carga una constante con el tamaño indicado; cero se emite como
    /// `xor`.
    pub(super) fn load_constant_to_register(
        &mut self,
        value: i32,
        reg: Reg,
        desired_size: i32,
    ) -> Compile<()> {
        if value == 0 {
            return self.zero_register(reg, desired_size);
        }

        self.mark_register_discarded(reg)?;

        match desired_size.min(4) {
            1 => {
                self.buf.code(&[opr(0xB0, reg), value as u8]);
            }
            2 => {
                self.buf
                    .code(&[opr(0xB8, reg), value as u8, (value >> 8) as u8]);
            }
            _ => {
                self.buf.code(&[
                    0x66,
                    opr(0xB8, reg),
                    value as u8,
                    (value >> 8) as u8,
                    (value >> 16) as u8,
                    (value >> 24) as u8,
                ]);
            }
        }

        Ok(())
    }

    /// `xor r, r`
    pub(super) fn zero_register(&mut self, reg: Reg, desired_size: i32) -> Compile<()> {
        self.mark_register_discarded(reg)?;

        match desired_size.min(4) {
            1 => {
                self.buf.code(&[0x32, xrm(3, reg.code(), reg.code())]);
            }
            2 => {
                self.buf.code(&[0x33, xrm(3, reg.code(), reg.code())]);
            }
            _ => {
                self.buf.code(&[0x66, 0x33, xrm(3, reg.code(), reg.code())]);
            }
        }

        Ok(())
    }
}
