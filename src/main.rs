use anyhow::{bail, Context};
use clap::{crate_version, App, Arg};
use compiler::compile;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;

fn main() -> anyhow::Result<()> {
    let args = App::new("DOS MZ compiler")
        .version(crate_version!())
        .arg(
            Arg::new("target")
                .short('t')
                .long("target")
                .value_name("TARGET")
                .takes_value(true)
                .default_value("dos")
                .help("Compilation target"),
        )
        .arg(
            Arg::new("files")
                .takes_value(true)
                .multiple_values(true)
                .min_values(1)
                .max_values(2)
                .required(true)
                .value_name("FILE")
                .help("Input and output files (with a single file, source is read from stdin)"),
        )
        .get_matches();

    if args.value_of("target") != Some("dos") {
        bail!("Unsupported compilation target");
    }

    let files: Vec<&str> = args.values_of("files").unwrap().collect();
    let (source, directory, output) = match files.as_slice() {
        [output] => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("Failed to read source from standard input")?;

            (source, PathBuf::from("."), PathBuf::from(output))
        }

        [input, output] => {
            let source = fs::read_to_string(input)
                .with_context(|| format!("Failed to open input file: {}", input))?;

            // Los "#include" relativos se resuelven contra el
            // directorio del archivo de entrada
            let directory = Path::new(input)
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));

            (source, directory, PathBuf::from(output))
        }

        _ => unreachable!("clap limits the file list to two entries"),
    };

    match compile(&source, &directory) {
        Ok(image) => {
            fs::write(&output, image)
                .with_context(|| format!("Failed to create output file: {}", output.display()))?;
            Ok(())
        }
        Err(diagnostic) => {
            eprintln!("{}", diagnostic);
            eprintln!("Build failed!");
            process::exit(1);
        }
    }
}
