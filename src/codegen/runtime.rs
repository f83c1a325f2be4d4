//! Rutinas compartidas del runtime.
//!
//! Un catálogo fijo de rutinas i386 escritas a mano que el código
//! generado invoca a través de la convención estándar. Cada rutina se
//! emite solo si fue referenciada; las llamadas pendientes se
//! resuelven contra su posición al emitirla.
//!
//! `PrintUint32`, `PrintNewLine` y `ReadUint32` comparten un búfer de
//! E/S de 32 bytes colocado antes de las rutinas. Todas las salidas a
//! consola usan el servicio 09h del int 21h, la entrada el servicio
//! 0Ah, y la administración de memoria los servicios 48h/49h.

use super::{Emitter, FixupTarget};
use crate::codegen::i386::{opr, xrm, Reg, Segment};
use crate::error::Compile;
use crate::sym::BaseType;

/// Tamaño del búfer compartido de E/S.
const IO_BUFFER_SIZE: u16 = 0x20;

impl<'a> Emitter<'a> {
    fn shared_referenced(&self, name: &str) -> bool {
        self.symbols
            .iter()
            .any(|s| s.typ.base == BaseType::SharedFunction && s.name == name && s.ref_count > 0)
    }

    /// Emite las rutinas referenciadas, en orden fijo.
    pub(super) fn emit_shared_functions(&mut self) -> Compile<()> {
        let io_buffer_needed = ["PrintUint32", "PrintNewLine", "ReadUint32"]
            .iter()
            .any(|name| self.shared_referenced(name));

        let mut io_buffer_address: u16 = 0;
        if io_buffer_needed {
            io_buffer_address = (self.buf.ip() as u16).wrapping_add(crate::exe::PSP_SIZE);
            self.buf.code(&[0u8; IO_BUFFER_SIZE as usize]);
        }

        if self.begin_shared("PrintUint32")? {
            self.emit_print_uint32(io_buffer_address);
        }
        if self.begin_shared("PrintString")? {
            self.emit_print_string();
        }
        if self.begin_shared("PrintNewLine")? {
            self.emit_print_new_line(io_buffer_address);
        }
        if self.begin_shared("ReadUint32")? {
            self.emit_read_uint32(io_buffer_address);
        }
        if self.begin_shared("GetCommandLine")? {
            self.emit_get_command_line();
        }
        if self.begin_shared("#StringsEqual")? {
            self.emit_strings_equal();
        }
        if self.begin_shared("#Alloc")? {
            self.emit_alloc();
        }
        if self.begin_shared("release")? {
            self.emit_release();
        }

        Ok(())
    }

    /// Resuelve las llamadas pendientes a la rutina si está
    /// referenciada.
    fn begin_shared(&mut self, name: &str) -> Compile<bool> {
        if !self.shared_referenced(name) {
            return Ok(false);
        }

        let ip_dst = self.buf.ip();
        self.backpatch_labels(name, ip_dst, |t| matches!(t, FixupTarget::Function(_)))?;
        Ok(true)
    }

    /// Convierte el parámetro a dígitos decimales de atrás hacia
    /// adelante dentro del búfer y lo escribe a consola.
    fn emit_print_uint32(&mut self, io_buffer_address: u16) {
        let buf = &mut self.buf;

        buf.asm_proc_enter();

        // mov eax, ss:[bp + 6]
        buf.code(&[0x66, 0x8B, xrm(1, Reg::Ax.code(), 6), 6]);

        buf.code(&[0x66, opr(0xB8, Reg::Cx), 10, 0, 0, 0]); // mov ecx, 10
        buf.code(&[opr(0xB8, Reg::Di), 20, 0]); // mov di, 20

        // mov [buffer + di], '$'
        buf.code(&[
            0xC6,
            xrm(2, 0, 5),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
            b'$',
        ]);

        let loop_ip = buf.ip();

        buf.asm_dec(Reg::Di, 2);

        // xor edx, edx
        buf.code(&[0x66, 0x33, xrm(3, Reg::Dx.code(), Reg::Dx.code())]);

        // div ecx
        buf.code(&[0x66, 0xF7, xrm(3, 6, Reg::Cx.code())]);

        // add dl, '0'
        buf.code(&[0x80, xrm(3, 0, Reg::Dx.code()), b'0']);

        // mov [buffer + di], dl
        buf.code(&[
            0x88,
            xrm(2, Reg::Dx.code(), 5),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
        ]);

        // cmp eax, 0
        buf.code(&[0x66, 0x83, xrm(3, 7, Reg::Ax.code()), 0]);

        // jnz [loop]
        let rel = loop_ip - (buf.ip() + 2);
        buf.code(&[0x75, rel as u8]);

        buf.code(&[
            opr(0xB8, Reg::Dx),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
        ]);

        buf.asm_add_rr(Reg::Dx, Reg::Di, 2);

        buf.asm_int_ah(0x21, 0x09);

        buf.asm_proc_leave(4, false);
    }

    /// Termina temporalmente la cadena con `'$'`, la escribe y
    /// restaura el byte original.
    fn emit_print_string(&mut self) {
        let buf = &mut self.buf;

        buf.asm_proc_enter();

        // mov dx, ss:[bp + 6]
        buf.code(&[0x8B, xrm(1, Reg::Dx.code(), 6), 6]);

        buf.asm_mov_rr(Reg::Si, Reg::Dx, 2);

        let loop_ip = buf.ip();

        // mov bl, [si]
        buf.code(&[0x8A, xrm(0, Reg::Bx.code(), 4)]);

        buf.asm_inc(Reg::Si, 2);

        buf.asm_or_rr(Reg::Bx, Reg::Bx, 1);

        // jnz [loop]
        let rel = loop_ip - (buf.ip() + 2);
        buf.code(&[0x75, rel as u8]);

        buf.asm_dec(Reg::Si, 2);

        // mov [si], '$'
        buf.code(&[0xC6, xrm(0, 0, 4), b'$']);

        buf.asm_int_ah(0x21, 0x09);

        // mov [si], bl
        buf.code(&[0x88, xrm(0, Reg::Bx.code(), 4)]);

        buf.asm_proc_leave(2, false);
    }

    fn emit_print_new_line(&mut self, io_buffer_address: u16) {
        let buf = &mut self.buf;

        // mov [buffer], '\r\n$\0'
        buf.code(&[
            0x66,
            0xC7,
            xrm(0, 0, 6),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
            0x0D,
            0x0A,
            0x24,
            0x00,
        ]);

        buf.code(&[
            opr(0xB8, Reg::Dx),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
        ]);

        buf.asm_int_ah(0x21, 0x09);

        buf.asm_proc_leave_no_args(0);
    }

    /// Entrada de teclado con búfer del DOS seguida de la conversión
    /// de ASCII decimal a entero en EAX.
    fn emit_read_uint32(&mut self, io_buffer_address: u16) {
        let buf = &mut self.buf;

        // mov [buffer], <tamaño del búfer, 0>
        buf.code(&[
            0xC7,
            xrm(0, 0, 6),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
            IO_BUFFER_SIZE as u8,
            (IO_BUFFER_SIZE >> 8) as u8,
        ]);

        buf.code(&[
            opr(0xB8, Reg::Dx),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
        ]);

        buf.asm_int_ah(0x21, 0x0A);

        // xor eax, eax / xor ebx, ebx
        buf.code(&[0x66, 0x33, xrm(3, Reg::Ax.code(), Reg::Ax.code())]);
        buf.code(&[0x66, 0x33, xrm(3, Reg::Bx.code(), Reg::Bx.code())]);

        buf.code(&[opr(0xB8, Reg::Si), 2, 0]); // mov si, 2
        buf.code(&[0x66, opr(0xB8, Reg::Cx), 10, 0, 0, 0]); // mov ecx, 10

        let loop_ip = buf.ip();

        // mov bl, [buffer + si]
        buf.code(&[
            0x8A,
            xrm(2, Reg::Bx.code(), 4),
            io_buffer_address as u8,
            (io_buffer_address >> 8) as u8,
        ]);

        // cmp bl, '9'
        buf.code(&[0x80, xrm(3, 7, Reg::Bx.code()), b'9']);

        // ja [end]
        let ja_offset = buf.code(&[0x77, 0]) + 1;
        let ja_ip = buf.ip();

        // sub bl, '0'
        buf.code(&[0x80, xrm(3, 5, Reg::Bx.code()), b'0']);

        // jb [end]
        let jb_offset = buf.code(&[0x72, 0]) + 1;
        let jb_ip = buf.ip();

        // mul ecx
        buf.code(&[0x66, 0xF7, xrm(3, 4, Reg::Cx.code())]);

        buf.asm_add_rr(Reg::Ax, Reg::Bx, 4);

        buf.asm_inc(Reg::Si, 2);

        // jmp [loop]
        let rel = loop_ip - (buf.ip() + 2);
        buf.code(&[0xEB, rel as u8]);

        // Ya se conoce la posición de salida
        let end = buf.ip();
        buf.patch_i8(ja_offset, (end - ja_ip) as i8);
        buf.patch_i8(jb_offset, (end - jb_ip) as i8);

        buf.asm_proc_leave_no_args(0);
    }

    /// Localiza la cola de comando en el PSP (offset 0x81), recorta
    /// espacios a ambos lados y la termina en NUL.
    fn emit_get_command_line(&mut self) {
        let buf = &mut self.buf;

        // mov si, 0x81 - 1
        buf.code(&[opr(0xB8, Reg::Si), 0x80, 0]);

        let loop1 = buf.ip();

        // Hacia adelante hasta el primer carácter visible
        buf.code(&[opr(0x40, Reg::Si)]); // inc si

        // cmp [si], ' '
        buf.code(&[0x80, xrm(0, 7, 4), b' ']);

        // jz [loop1]
        let rel = loop1 - (buf.ip() + 2);
        buf.code(&[0x74, rel as u8]);

        // La dirección inicial se entrega en AX
        buf.asm_mov_rr(Reg::Ax, Reg::Si, 2);

        buf.asm_dec(Reg::Si, 2);

        let loop2 = buf.ip();

        // Hacia adelante hasta el retorno de carro
        buf.asm_inc(Reg::Si, 2);

        // cmp [si], '\r'
        buf.code(&[0x80, xrm(0, 7, 4), b'\r']);

        // jnz [loop2]
        let rel = loop2 - (buf.ip() + 2);
        buf.code(&[0x75, rel as u8]);

        let loop3 = buf.ip();

        // Hacia atrás hasta el último carácter visible
        buf.asm_dec(Reg::Si, 2);

        // cmp [si], ' '
        buf.code(&[0x80, xrm(0, 7, 4), b' ']);

        // jz [loop3]
        let rel = loop3 - (buf.ip() + 2);
        buf.code(&[0x74, rel as u8]);

        buf.asm_inc(Reg::Si, 2);

        // mov [si], '\0'
        buf.code(&[0xC6, xrm(0, 0, 4), 0x00]);

        buf.asm_proc_leave_no_args(0);
    }

    /// Comparación byte por byte de dos cadenas terminadas en NUL;
    /// retorna 1 en AL si son iguales.
    fn emit_strings_equal(&mut self) {
        let buf = &mut self.buf;

        buf.asm_proc_enter();

        // mov si, ss:[bp + 6]
        buf.code(&[0x8B, xrm(1, Reg::Si.code(), 6), 6]);

        // mov di, ss:[bp + 8]
        buf.code(&[0x8B, xrm(1, Reg::Di.code(), 6), 8]);

        // cmp si, di
        buf.code(&[0x39, xrm(3, Reg::Di.code(), Reg::Si.code())]);

        // jz [equal]
        let jz_offset = buf.code(&[0x74, 0]) + 1;
        let jz_ip = buf.ip();

        buf.asm_dec(Reg::Di, 2);

        let loop_ip = buf.ip();

        buf.asm_inc(Reg::Di, 2);

        // lodsb
        buf.code(&[0xAC]);

        // cmp [di], al
        buf.code(&[0x38, xrm(0, Reg::Ax.code(), 5)]);

        // jnz [not_equal]
        let jnz_offset = buf.code(&[0x75, 0]) + 1;
        let jnz_ip = buf.ip();

        // cmp al, 0
        buf.code(&[0x80, xrm(3, 7, Reg::Ax.code()), 0]);

        // jnz [loop]
        let rel = loop_ip - (buf.ip() + 2);
        buf.code(&[0x75, rel as u8]);

        // Son iguales
        let equal = buf.ip();
        buf.patch_i8(jz_offset, (equal - jz_ip) as i8);

        buf.code(&[opr(0xB0, Reg::Ax), 1]); // mov al, 1

        // jmp [end]
        let jmp_offset = buf.code(&[0xEB, 0]) + 1;
        let jmp_ip = buf.ip();

        // No son iguales
        let not_equal = buf.ip();
        buf.patch_i8(jnz_offset, (not_equal - jnz_ip) as i8);

        buf.code(&[0x32, xrm(3, Reg::Ax.code(), Reg::Ax.code())]); // xor al, al

        let end = buf.ip();
        buf.patch_i8(jmp_offset, (end - jmp_ip) as i8);

        buf.asm_proc_leave(4, false);
    }

    /// Reserva de memoria del DOS: convierte bytes a párrafos con
    /// redondeo, y retorna un puntero relativo a DS o nulo si la
    /// reserva falla o queda fuera del alcance del segmento.
    fn emit_alloc(&mut self) {
        let buf = &mut self.buf;

        buf.asm_proc_enter();

        // mov ebx, ss:[bp + 6]
        buf.code(&[0x66, 0x8B, xrm(1, Reg::Bx.code(), 6), 6]);

        // or bx, bx
        buf.asm_or_rr(Reg::Bx, Reg::Bx, 2);

        // jz [ret_null]
        let jz_offset = buf.code(&[0x74, 0]) + 1;
        let jz_ip = buf.ip();

        // No pueden reservarse más de 64k bytes
        // test ebx, 0xFFFF0000
        buf.code(&[0x66, 0xF7, xrm(3, 0, Reg::Bx.code()), 0x00, 0x00, 0xFF, 0xFF]);

        // jnz [ret_null]
        let jnz_offset = buf.code(&[0x75, 0]) + 1;
        let jnz_ip = buf.ip();

        // Bytes a párrafos con redondeo hacia arriba
        // add bx, 15
        buf.code(&[0x81, xrm(3, 0, Reg::Bx.code()), 15, 0]);

        // shr bx, 4
        buf.code(&[0xC1, xrm(3, 5, Reg::Bx.code()), 4]);

        buf.asm_int_ah(0x21, 0x48);

        // La reserva falló
        // jb [ret_null]
        let jb_offset = buf.code(&[0x72, 0]) + 1;
        let jb_ip = buf.ip();

        // Desbordamiento del segmento de 16 bits
        // test ax, 0xF000
        buf.code(&[0xF7, xrm(3, 0, Reg::Ax.code()), 0x00, 0xF0]);

        // jnz [release_and_ret_null]
        let far_offset = buf.code(&[0x75, 0]) + 1;
        let far_ip = buf.ip();

        // Respaldo del segmento reservado
        buf.asm_mov_rr(Reg::Cx, Reg::Ax, 2);

        buf.asm_mov_from_segment(Reg::Bx, Segment::Ds);

        buf.asm_sub_rr(Reg::Ax, Reg::Bx, 2);

        // Segmento demasiado lejos para usarse
        // jb [restore_release_and_ret_null]
        let restore_offset = buf.code(&[0x72, 0]) + 1;
        let restore_ip = buf.ip();

        // Segmento a puntero
        // shl ax, 4
        buf.code(&[0xC1, xrm(3, 4, Reg::Ax.code()), 4]);

        // jmp [ret_ptr]
        let done_offset = buf.code(&[0xEB, 0]) + 1;
        let done_ip = buf.ip();

        // restore_release_and_ret_null:
        let restore_release = buf.ip();
        buf.patch_i8(restore_offset, (restore_release - restore_ip) as i8);

        buf.asm_mov_rr(Reg::Ax, Reg::Cx, 2);

        // release_and_ret_null:
        let release_null = buf.ip();
        buf.patch_i8(far_offset, (release_null - far_ip) as i8);

        // El segmento se libera preservando ES
        buf.asm_mov_from_segment(Reg::Cx, Segment::Es);
        buf.asm_mov_to_segment(Segment::Es, Reg::Ax);
        buf.asm_int_ah(0x21, 0x49);
        buf.asm_mov_to_segment(Segment::Es, Reg::Cx);

        // ret_null:
        let ret_null = buf.ip();
        buf.patch_i8(jz_offset, (ret_null - jz_ip) as i8);
        buf.patch_i8(jnz_offset, (ret_null - jnz_ip) as i8);
        buf.patch_i8(jb_offset, (ret_null - jb_ip) as i8);

        buf.code(&[0x33, xrm(3, Reg::Ax.code(), Reg::Ax.code())]); // xor ax, ax

        // ret_ptr:
        let ret_ptr = buf.ip();
        buf.patch_i8(done_offset, (ret_ptr - done_ip) as i8);

        // El parámetro ocupa 4 bytes en la pila
        buf.asm_proc_leave(4, false);
    }

    /// Devuelve al DOS el segmento que contiene al puntero.
    fn emit_release(&mut self) {
        let buf = &mut self.buf;

        buf.asm_proc_enter();

        // mov ax, ss:[bp + 6]
        buf.code(&[0x8B, xrm(1, Reg::Ax.code(), 6), 6]);

        // Puntero a segmento
        // shr ax, 4
        buf.code(&[0xC1, xrm(3, 5, Reg::Ax.code()), 4]);

        buf.asm_mov_from_segment(Reg::Cx, Segment::Es);
        buf.asm_mov_from_segment(Reg::Bx, Segment::Ds);

        buf.asm_add_rr(Reg::Ax, Reg::Bx, 2);

        buf.asm_mov_to_segment(Segment::Es, Reg::Ax);

        buf.asm_int_ah(0x21, 0x49);

        buf.asm_mov_to_segment(Segment::Es, Reg::Cx);

        buf.asm_proc_leave(2, false);
    }
}
