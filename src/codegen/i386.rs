//! Emisión de bytes para la arquitectura i386 en modo real.
//!
//! El búfer de salida crece bajo demanda y distingue dos posiciones:
//! el offset absoluto dentro del archivo y el IP nativo, que solo
//! avanza con bytes de código (el encabezado no cuenta). Los saltos
//! relativos y los accesos a datos se calculan sobre el IP nativo.
//!
//! Las rutinas `asm_*` emiten codificaciones fijas de una instrucción;
//! el modo de 16 bits es el predeterminado y el prefijo `0x66`
//! selecciona operandos de 32 bits.

/// Registros de propósito general. El valor es el código de registro
/// usado por las codificaciones ModRM.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reg {
    Ax = 0,
    Cx = 1,
    Dx = 2,
    Bx = 3,
    Sp = 4,
    Bp = 5,
    Si = 6,
    Di = 7,
}

impl Reg {
    /// Los primeros cuatro registros son asignables a variables; los
    /// demás se usan explícitamente como direcciones o auxiliares.
    pub const ALLOCATABLE: [Reg; 4] = [Reg::Ax, Reg::Cx, Reg::Dx, Reg::Bx];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Código de la mitad alta de 8 bits del registro (AH, CH, ...).
    pub fn high8(self) -> u8 {
        self as u8 + 4
    }
}

/// Registros de segmento.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    Es = 0,
    Ss = 2,
    Ds = 3,
}

/// Byte ModRM a partir de sus tres campos.
pub fn xrm(x: u8, r: u8, m: u8) -> u8 {
    ((x << 6) & 0xC0) | ((r << 3) & 0x38) | (m & 0x07)
}

/// Opcode con registro embebido en los tres bits bajos.
pub fn opr(op: u8, r: Reg) -> u8 {
    op + (r.code() & 0x07)
}

/// Búfer de salida con puntero de instrucción nativo.
pub struct Buffer {
    bytes: Vec<u8>,
    ip_dst: i32,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            bytes: Vec::new(),
            ip_dst: 0,
        }
    }

    /// IP nativo actual.
    pub fn ip(&self) -> i32 {
        self.ip_dst
    }

    /// Offset absoluto actual dentro del archivo.
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    /// Agrega bytes sin avanzar el IP nativo; solo el encabezado.
    pub fn raw(&mut self, data: &[u8]) -> usize {
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(data);
        offset
    }

    /// Agrega bytes de código avanzando el IP nativo. Retorna el
    /// offset absoluto donde quedaron escritos.
    pub fn code(&mut self, data: &[u8]) -> usize {
        self.ip_dst += data.len() as i32;
        self.raw(data)
    }

    pub fn patch_u8(&mut self, offset: usize, value: u8) {
        self.bytes[offset] = value;
    }

    pub fn patch_i8(&mut self, offset: usize, value: i8) {
        self.bytes[offset] = value as u8;
    }

    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset] = value as u8;
        self.bytes[offset + 1] = (value >> 8) as u8;
    }

    pub fn patch_i16(&mut self, offset: usize, value: i16) {
        self.patch_u16(offset, value as u16);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        self.bytes[offset] as u16 | ((self.bytes[offset + 1] as u16) << 8)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    // ------------------------------------------------------------------
    // Instrucciones de codificación fija

    /// `mov to, from` entre registros.
    pub fn asm_mov_rr(&mut self, to: Reg, from: Reg, size: i32) {
        match size {
            1 => {
                self.code(&[0x8A, xrm(3, to.code(), from.code())]);
            }
            2 => {
                self.code(&[0x8B, xrm(3, to.code(), from.code())]);
            }
            _ => {
                self.code(&[0x66, 0x8B, xrm(3, to.code(), from.code())]);
            }
        }
    }

    /// `mov r16, sreg`
    pub fn asm_mov_from_segment(&mut self, r16: Reg, sreg: Segment) {
        self.code(&[0x8C, xrm(3, sreg as u8, r16.code())]);
    }

    /// `mov sreg, r16`
    pub fn asm_mov_to_segment(&mut self, sreg: Segment, r16: Reg) {
        self.code(&[0x8E, xrm(3, sreg as u8, r16.code())]);
    }

    /// `add to, from`
    pub fn asm_add_rr(&mut self, to: Reg, from: Reg, size: i32) {
        match size {
            1 => {
                self.code(&[0x00, xrm(3, from.code(), to.code())]);
            }
            2 => {
                self.code(&[0x01, xrm(3, from.code(), to.code())]);
            }
            _ => {
                self.code(&[0x66, 0x01, xrm(3, from.code(), to.code())]);
            }
        }
    }

    /// `sub to, from`
    pub fn asm_sub_rr(&mut self, to: Reg, from: Reg, size: i32) {
        match size {
            1 => {
                self.code(&[0x28, xrm(3, from.code(), to.code())]);
            }
            2 => {
                self.code(&[0x29, xrm(3, from.code(), to.code())]);
            }
            _ => {
                self.code(&[0x66, 0x29, xrm(3, from.code(), to.code())]);
            }
        }
    }

    /// `inc r`
    pub fn asm_inc(&mut self, r: Reg, size: i32) {
        match size {
            1 => {
                self.code(&[0xFE, xrm(3, 0, r.code())]);
            }
            2 => {
                self.code(&[opr(0x40, r)]);
            }
            _ => {
                self.code(&[0x66, opr(0x40, r)]);
            }
        }
    }

    /// `dec r`
    pub fn asm_dec(&mut self, r: Reg, size: i32) {
        match size {
            1 => {
                self.code(&[0xFE, xrm(3, 1, r.code())]);
            }
            2 => {
                self.code(&[opr(0x48, r)]);
            }
            _ => {
                self.code(&[0x66, opr(0x48, r)]);
            }
        }
    }

    /// `or to, from`
    pub fn asm_or_rr(&mut self, to: Reg, from: Reg, size: i32) {
        match size {
            1 => {
                self.code(&[0x08, xrm(3, from.code(), to.code())]);
            }
            2 => {
                self.code(&[0x09, xrm(3, from.code(), to.code())]);
            }
            _ => {
                self.code(&[0x66, 0x09, xrm(3, from.code(), to.code())]);
            }
        }
    }

    /// Prólogo estándar: `push ebp; mov ebp, esp`.
    pub fn asm_proc_enter(&mut self) {
        self.code(&[
            0x66,
            opr(0x50, Reg::Bp),
            0x66,
            0x8B,
            xrm(3, Reg::Bp.code(), Reg::Sp.code()),
        ]);
    }

    /// Epílogo estándar: restaura la pila, recupera `ebp` y retorna
    /// liberando `retn_imm16` bytes de parámetros.
    pub fn asm_proc_leave(&mut self, retn_imm16: u16, restore_sp: bool) {
        if restore_sp {
            // Solo es necesario si el procedimiento movió la pila
            self.code(&[0x66, 0x8B, xrm(3, Reg::Sp.code(), Reg::Bp.code())]);
        }

        self.code(&[0x66, opr(0x58, Reg::Bp)]);
        self.asm_proc_leave_no_args(retn_imm16);
    }

    /// `retn [imm16]` sin restaurar pila ni base.
    pub fn asm_proc_leave_no_args(&mut self, retn_imm16: u16) {
        if retn_imm16 > 0 {
            self.code(&[0xC2, retn_imm16 as u8, (retn_imm16 >> 8) as u8]);
        } else {
            self.code(&[0xC3]);
        }
    }

    /// `int imm8`
    pub fn asm_int(&mut self, imm8: u8) {
        self.code(&[0xCD, imm8]);
    }

    /// `mov ah, imm8; int imm8` — la forma usual de invocar servicios
    /// del DOS.
    pub fn asm_int_ah(&mut self, imm8: u8, ah_imm8: u8) {
        self.code(&[0xB4, ah_imm8, 0xCD, imm8]);
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_advances_native_ip_and_raw_does_not() {
        let mut buf = Buffer::new();
        buf.raw(&[0; 32]);
        assert_eq!(buf.ip(), 0);
        assert_eq!(buf.offset(), 32);

        buf.code(&[0x90, 0x90]);
        assert_eq!(buf.ip(), 2);
        assert_eq!(buf.offset(), 34);
    }

    #[test]
    fn modrm_encoding() {
        assert_eq!(xrm(3, 0, 1), 0xC1);
        assert_eq!(xrm(1, Reg::Ax.code(), 6), 0x46);
        assert_eq!(opr(0xB8, Reg::Bx), 0xBB);
    }

    #[test]
    fn proc_enter_matches_known_encoding() {
        let mut buf = Buffer::new();
        buf.asm_proc_enter();
        assert_eq!(buf.into_bytes(), vec![0x66, 0x55, 0x66, 0x8B, 0xEC]);
    }

    #[test]
    fn patches_are_little_endian() {
        let mut buf = Buffer::new();
        buf.raw(&[0; 4]);
        buf.patch_u16(1, 0x1234);
        assert_eq!(buf.read_u16(1), 0x1234);
        assert_eq!(buf.into_bytes(), vec![0x00, 0x34, 0x12, 0x00]);
    }
}
