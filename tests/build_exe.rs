use compiler::compile;
use std::path::Path;

fn build(source: &str) -> Vec<u8> {
    compile(source, Path::new(".")).expect("compile")
}

fn read_u16(image: &[u8], offset: usize) -> u16 {
    image[offset] as u16 | ((image[offset + 1] as u16) << 8)
}

/// Verifica la consistencia interna del encabezado MZ.
fn check_header(image: &[u8]) {
    assert_eq!(&image[0..2], b"MZ");

    let header_paragraphs = read_u16(image, 8);
    assert_eq!(header_paragraphs as usize * 16, 32);

    // El cuerpo comienza tras el encabezado alineado a párrafo
    let body_len = (image.len() - 32) as u16;
    let block_count = read_u16(image, 4);
    let last_block_size = read_u16(image, 2);
    if last_block_size > 0 {
        assert_eq!((block_count - 1) * 512 + last_block_size, body_len);
    } else {
        assert_eq!(block_count * 512, body_len);
    }

    // Sin relocalizaciones y sin desplazamiento de segmento de código
    assert_eq!(read_u16(image, 6), 0);
    assert_eq!(read_u16(image, 14), 0); // ss plegado
    assert_eq!(read_u16(image, 22), 0); // cs

    // El punto de entrada cae dentro del cuerpo
    let entry = read_u16(image, 20);
    assert!((entry as usize) < body_len as usize);
}

fn contains(image: &[u8], needle: &[u8]) -> bool {
    image.windows(needle.len()).any(|window| window == needle)
}

fn count_occurrences(image: &[u8], needle: &[u8]) -> usize {
    image.windows(needle.len()).filter(|w| *w == needle).count()
}

#[test]
fn empty_entry_point() {
    let image = build("uint8 Main() { return 0; }");
    check_header(&image);

    // mov al, 0; mov ah, 4Ch; int 21h
    assert!(contains(&image, &[0xB0, 0x00, 0xB4, 0x4C, 0xCD, 0x21]));
}

#[test]
fn arithmetic_echo() {
    let image = build(
        "uint8 Main() {\n\
         \tuint32 x = ReadUint32();\n\
         \tPrintUint32(x + 1);\n\
         \tPrintNewLine();\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);

    // Entrada con búfer del DOS (AH=0Ah) y salida por cadena (AH=09h)
    assert!(contains(&image, &[0xB4, 0x0A, 0xCD, 0x21]));
    assert!(contains(&image, &[0xB4, 0x09, 0xCD, 0x21]));
}

#[test]
fn branch_with_strings() {
    let image = build(
        "uint8 Main() {\n\
         \tuint8 x = 3;\n\
         \tif (x > 2) { PrintString(\"Y\"); } else { PrintString(\"N\"); }\n\
         \tPrintNewLine();\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);

    // Ambos literales viven en la tabla de cadenas con su NUL
    assert!(contains(&image, b"Y\0"));
    assert!(contains(&image, b"N\0"));
}

#[test]
fn loop_with_break() {
    let image = build(
        "uint8 Main() {\n\
         \tuint8 i = 0;\n\
         \twhile (true) {\n\
         \t\tif (i >= 3) break;\n\
         \t\ti = i + 1;\n\
         \t}\n\
         \tPrintUint32(i);\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);
}

#[test]
fn pointer_and_alloc() {
    let image = build(
        "uint8 Main() {\n\
         \tuint8* p = alloc<uint8>(4);\n\
         \tp[0] = 65;\n\
         \tp[1] = 66;\n\
         \tp[2] = 67;\n\
         \tp[3] = 0;\n\
         \tPrintString(cast<string>(p));\n\
         \trelease(p);\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);

    // Reserva y liberación de memoria del DOS
    assert!(contains(&image, &[0xB4, 0x48, 0xCD, 0x21]));
    assert!(contains(&image, &[0xB4, 0x49, 0xCD, 0x21]));
}

#[test]
fn unreferenced_functions_leave_no_bytes() {
    let with_unused = build(
        "uint32 Unused() { return 123; }\n\
         uint8 Main() { return 0; }",
    );
    let without = build("uint8 Main() { return 0; }");

    assert_eq!(with_unused, without);
}

#[test]
fn unreferenced_function_drops_its_runtime_routines() {
    // La rutina compartida solo se emite si alguna función alcanzable
    // la llama
    let with_dead_caller = build(
        "void Dead() { PrintString(\"X\"); return; }\n\
         uint8 Main() { return 0; }",
    );
    let without = build("uint8 Main() { return 0; }");

    assert_eq!(with_dead_caller, without);
}

#[test]
fn forward_goto() {
    let image = build(
        "uint8 Main() {\n\
         \tgoto End;\n\
         \tPrintString(\"X\");\n\
         End:\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);
}

#[test]
fn equal_literals_share_one_copy() {
    let image = build(
        "uint8 Main() {\n\
         \tPrintString(\"hola\");\n\
         \tPrintString(\"hola\");\n\
         \treturn 0;\n\
         }",
    );

    assert_eq!(count_occurrences(&image, b"hola\0"), 1);
}

#[test]
fn stack_directive_moves_stack_pointer() {
    let source = |stack: u32| {
        format!(
            "#stack {}\n\
             uint8 Main() {{ return 0; }}",
            stack
        )
    };

    let small = build(&source(1024));
    let large = build(&source(2048));

    // El mismo código, con la pila corrida exactamente la diferencia
    assert_eq!(small.len(), large.len());
    assert_eq!(read_u16(&large, 16) - read_u16(&small, 16), 1024);
}

#[test]
fn deterministic_output() {
    let source = "uint8 Main() {\n\
                  \tuint32 x = ReadUint32();\n\
                  \tPrintUint32(x * 2);\n\
                  \treturn 0;\n\
                  }";

    assert_eq!(build(source), build(source));
}

#[test]
fn dependent_function_is_kept() {
    let image = build(
        "uint32 Twice(uint32 n) { return n * 2; }\n\
         uint8 Main() { PrintUint32(Twice(21)); return 0; }",
    );
    check_header(&image);

    // call rel16 hacia Twice en algún punto del cuerpo
    assert!(contains(&image, &[0xB4, 0x09])); // PrintUint32 presente
}

#[test]
fn prototypes_are_resolved() {
    let image = build(
        "uint32 Twice(uint32 n);\n\
         uint8 Main() { PrintUint32(Twice(21)); return 0; }\n\
         uint32 Twice(uint32 n) { return n * 2; }",
    );
    check_header(&image);
}

#[test]
fn include_directive_pulls_in_sources() {
    let dir = std::env::temp_dir().join("mz_compiler_include_test");
    std::fs::create_dir_all(&dir).expect("create include dir");
    std::fs::write(
        dir.join("twice.inc"),
        "uint32 Twice(uint32 n) { return n * 2; }\n",
    )
    .expect("write include");

    let source = "#include \"twice.inc\"\n\
                  uint8 Main() { PrintUint32(Twice(4)); return 0; }";
    let image = compile(source, &dir).expect("compile with include");
    check_header(&image);
}

#[test]
fn missing_entry_point_is_rejected() {
    let error = compile("uint32 F() { return 1; }", Path::new(".")).unwrap_err();
    assert!(error.message.contains("Main"));
}

#[test]
fn break_outside_loop_is_rejected() {
    let error = compile("uint8 Main() { break; return 0; }", Path::new(".")).unwrap_err();
    assert!(error.message.contains("break"));
}

#[test]
fn undeclared_variable_is_rejected() {
    let error = compile("uint8 Main() { x = 1; return 0; }", Path::new(".")).unwrap_err();
    assert!(error.message.contains("x"));
}

#[test]
fn call_arity_mismatch_is_rejected() {
    let error = compile(
        "uint8 Main() { PrintUint32(1, 2); return 0; }",
        Path::new("."),
    )
    .unwrap_err();
    assert!(error.message.contains("parameter count"));
}

#[test]
fn narrowing_assignment_is_rejected() {
    let error = compile(
        "uint8 Main() { uint32 x = 70000; uint8 y = x; return 0; }",
        Path::new("."),
    )
    .unwrap_err();
    assert!(error.message.contains("uint8"));
}

#[test]
fn prototype_mismatch_is_rejected() {
    let error = compile(
        "uint32 F(uint32 n);\n\
         uint8 F(uint32 n) { return 1; }\n\
         uint8 Main() { return 0; }",
        Path::new("."),
    )
    .unwrap_err();
    assert!(error.message.contains("Return type"));
}

#[test]
fn entry_point_signature_is_rejected() {
    let error = compile("uint32 Main() { return 0; }", Path::new(".")).unwrap_err();
    assert!(error.message.contains("uint8"));
}

#[test]
fn switch_compiles_with_dispatch_after_body() {
    let image = build(
        "uint8 Main() {\n\
         \tuint8 x = 2;\n\
         \tuint8 r = 0;\n\
         \tswitch (x) {\n\
         \tcase 1:\n\
         \t\tr = 10;\n\
         \t\tbreak;\n\
         \tcase 2:\n\
         \t\tr = 20;\n\
         \t\tbreak;\n\
         \tdefault:\n\
         \t\tr = 30;\n\
         \t}\n\
         \tPrintUint32(r);\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);
}

#[test]
fn do_while_and_for_compile() {
    let image = build(
        "uint8 Main() {\n\
         \tuint32 total = 0;\n\
         \tfor (uint8 i = 0; i < 5; i = i + 1) {\n\
         \t\tif (i == 3) continue;\n\
         \t\ttotal = total + i;\n\
         \t}\n\
         \tdo {\n\
         \t\ttotal = total - 1;\n\
         \t} while (total > 10);\n\
         \tPrintUint32(total);\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);
}

#[test]
fn short_circuit_in_assignment() {
    let image = build(
        "uint8 Main() {\n\
         \tuint8 a = 1;\n\
         \tuint8 b = 2;\n\
         \tbool c = a < b && b < 3;\n\
         \tif (c) { PrintUint32(1); }\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);
}

#[test]
fn static_variables_live_past_the_image() {
    let image = build(
        "static uint32 counter;\n\
         uint8 Main() {\n\
         \tcounter = 5;\n\
         \tPrintUint32(counter);\n\
         \treturn 0;\n\
         }",
    );
    check_header(&image);

    // La región estática no emite bytes: el DOS la provee con los
    // párrafos adicionales del encabezado
    let min_extra = read_u16(&image, 10);
    assert!(min_extra > 0);
    assert_eq!(min_extra, read_u16(&image, 12));
}
