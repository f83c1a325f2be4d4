//! Encabezado del formato ejecutable MZ de DOS.
//!
//! El encabezado se emite primero con sus campos en cero y se
//! finaliza cuando el tamaño de la imagen, los datos estáticos y el
//! punto de entrada se conocen. El modelo de memoria es plano: el
//! segmento de pila se pliega dentro del puntero de pila y `ss`
//! queda en cero.

use crate::codegen::i386::Buffer;

/// Tamaño del encabezado MZ sin relleno, en bytes.
pub const HEADER_SIZE: usize = 28;

/// Tamaño del Program Segment Prefix que el DOS antepone a la imagen.
pub const PSP_SIZE: u16 = 0x0100;

/// Tamaño de pila usado cuando la directiva `#stack` está ausente o
/// fuera del rango [32, 32768].
pub const DEFAULT_STACK_SIZE: u16 = 0x2000;

// Offsets de los campos del encabezado
const LAST_BLOCK_SIZE: usize = 2;
const BLOCK_COUNT: usize = 4;
const HEADER_PARAGRAPHS: usize = 8;
const MIN_EXTRA_PARAGRAPHS: usize = 10;
const MAX_EXTRA_PARAGRAPHS: usize = 12;
const SS: usize = 14;
const SP: usize = 16;
const IP: usize = 20;

/// Emite el encabezado con la firma y el relleno hasta una frontera
/// de párrafo, de modo que el código quede alineado.
pub fn emit_header(buf: &mut Buffer) {
    let header_paragraphs = ((HEADER_SIZE + 16 - 1) >> 4) as u16;

    let mut header = [0u8; HEADER_SIZE];
    header[0] = b'M';
    header[1] = b'Z';
    header[HEADER_PARAGRAPHS] = header_paragraphs as u8;
    header[HEADER_PARAGRAPHS + 1] = (header_paragraphs >> 8) as u8;
    buf.raw(&header);

    let remaining = ((header_paragraphs as usize) << 4) - HEADER_SIZE;
    if remaining > 0 {
        buf.raw(&vec![0u8; remaining]);
    }
}

/// Completa el encabezado: tamaño de imagen, memoria adicional, pila
/// y punto de entrada.
pub fn finalize_header(buf: &mut Buffer, static_size: i32, stack_size: u32, entry_ip: u16) {
    let ip_dst = buf.ip();

    // Tamaño de la imagen en bloques de 512 bytes
    let mut block_count = (ip_dst / 512) as u16;
    let last_block_size = (ip_dst % 512) as u16;
    if last_block_size > 0 {
        block_count += 1;
    }
    buf.patch_u16(BLOCK_COUNT, block_count);
    buf.patch_u16(LAST_BLOCK_SIZE, last_block_size);

    // La pila comienza después del código y los datos estáticos
    let ss = ((ip_dst + static_size + 16 - 1) >> 4) as u16;
    let mut sp = if (0x20..=0x8000).contains(&stack_size) {
        stack_size as u16
    } else {
        DEFAULT_STACK_SIZE
    };

    // Memoria adicional que el DOS debe reservar
    let extra = ((static_size as u32 + sp as u32 + 16 - 1) >> 4) as u16 + 1;
    buf.patch_u16(MIN_EXTRA_PARAGRAPHS, extra);
    buf.patch_u16(MAX_EXTRA_PARAGRAPHS, extra);

    // Ajuste para el modelo de memoria plano
    sp = sp
        .wrapping_add(ss << 4)
        .wrapping_add(PSP_SIZE);
    buf.patch_u16(SP, sp);
    buf.patch_u16(SS, 0);

    buf.patch_u16(IP, entry_ip);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_paragraph_aligned() {
        let mut buf = Buffer::new();
        emit_header(&mut buf);
        assert_eq!(buf.offset() % 16, 0);
        assert_eq!(buf.ip(), 0);
    }

    #[test]
    fn finalize_computes_blocks_and_stack() {
        let mut buf = Buffer::new();
        emit_header(&mut buf);
        buf.code(&vec![0x90; 600]);

        finalize_header(&mut buf, 32, 4096, 0x10);

        let bytes_len = 600;
        let block_count = buf.read_u16(BLOCK_COUNT);
        let last_block_size = buf.read_u16(LAST_BLOCK_SIZE);
        assert_eq!(
            (block_count as i32 - 1) * 512 + last_block_size as i32,
            bytes_len
        );

        // ss plegado en sp
        let ss = ((600 + 32 + 15) >> 4) as u16;
        assert_eq!(buf.read_u16(SS), 0);
        assert_eq!(buf.read_u16(SP), 4096 + (ss << 4) + PSP_SIZE);
        assert_eq!(buf.read_u16(IP), 0x10);
    }

    #[test]
    fn stack_size_is_clamped_to_default() {
        for request in [0u32, 16, 40000] {
            let mut buf = Buffer::new();
            emit_header(&mut buf);
            buf.code(&[0x90]);
            finalize_header(&mut buf, 0, request, 0);

            let ss = ((1 + 15) >> 4) as u16;
            assert_eq!(
                buf.read_u16(SP),
                DEFAULT_STACK_SIZE + (ss << 4) + PSP_SIZE
            );
        }
    }
}
