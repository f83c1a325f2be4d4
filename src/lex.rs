//! Análisis léxico.
//!
//! # Tokenization
//! Esta es la primera fase del compilador. Descompone el texto fuente
//! en unidades léxicas denominadas tokens. Los espacios en blanco y
//! los comentarios (`// ...` y `/* ... */`) se descartan durante esta
//! operación. Cada token emitido está asociado a la posición donde
//! comienza en el código fuente original.
//!
//! # Contenido de un token
//! Operadores, puntuación y palabras clave se identifican por el hecho
//! de lo que son y no incluyen lexemas. Los identificadores sí incluyen
//! su lexema original. Las constantes literales se resuelven a sus
//! valores en vez de preservar sus lexemas: las cadenas ya tienen los
//! escapes aplicados y los literales de carácter se reducen a su valor
//! entero little-endian.
//!
//! # Directivas
//! Una línea que comienza con `#` es una directiva y se consume
//! completa sin producir tokens. `#stack` ajusta el tamaño de pila
//! solicitado y `#include` apila un nuevo archivo de entrada; la pila
//! de entradas es LIFO y cada entrada se libera al alcanzar su EOF.
//! Una directiva desconocida produce solo una advertencia.

use crate::error::{syntax, Compile};
use crate::source::{Located, Position};

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Una palabra clave del lenguaje.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Keyword {
    Const,
    Static,
    Void,
    Bool,
    Uint8,
    Uint16,
    Uint32,
    StringType,
    If,
    Else,
    Return,
    Do,
    While,
    For,
    Switch,
    Case,
    Default,
    Continue,
    Break,
    Goto,
    Cast,
    Alloc,
    True,
    False,
    Null,
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        use Keyword::*;

        let keyword = match string {
            "const" => Const,
            "static" => Static,
            "void" => Void,
            "bool" => Bool,
            "uint8" => Uint8,
            "uint16" => Uint16,
            "uint32" => Uint32,
            "string" => StringType,
            "if" => If,
            "else" => Else,
            "return" => Return,
            "do" => Do,
            "while" => While,
            "for" => For,
            "switch" => Switch,
            "case" => Case,
            "default" => Default,
            "continue" => Continue,
            "break" => Break,
            "goto" => Goto,
            "cast" => Cast,
            "alloc" => Alloc,
            "true" => True,
            "false" => False,
            "null" => Null,
            _ => return Err(()),
        };

        Ok(keyword)
    }
}

/// Objeto resultante del análisis léxico.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// Identificador.
    Id(String),

    /// Palabra clave.
    Keyword(Keyword),

    /// Literal de entero decimal.
    IntLiteral(u32),

    /// Literal de carácter; `size` es la cantidad de bytes originales.
    CharLiteral { value: u32, size: u8 },

    /// Literal de cadena, con escapes ya resueltos.
    StringLiteral(String),

    /// `=`
    Assign,

    /// `+`
    Plus,

    /// `-`
    Minus,

    /// `*`
    Star,

    /// `/`
    Slash,

    /// `%`
    Percent,

    /// `<<`
    ShiftLeft,

    /// `>>`
    ShiftRight,

    /// `==`
    Equal,

    /// `!=`
    NotEqual,

    /// `<`
    Less,

    /// `>`
    Greater,

    /// `<=`
    LessOrEqual,

    /// `>=`
    GreaterOrEqual,

    /// `&&`
    LogAnd,

    /// `||`
    LogOr,

    /// `&`
    Ampersand,

    /// `(`
    OpenParen,

    /// `)`
    CloseParen,

    /// `[`
    OpenBracket,

    /// `]`
    CloseBracket,

    /// `{`
    OpenCurly,

    /// `}`
    CloseCurly,

    /// `,`
    Comma,

    /// `;`
    Semicolon,

    /// `:`
    Colon,
}

/// Una entrada apilada: texto pendiente y su posición de lectura.
struct Input {
    chars: Vec<char>,
    index: usize,
    position: Position,
    directory: PathBuf,
}

/// Máquina de estados para el análisis léxico.
///
/// El lexer mantiene una pila de entradas para resolver `#include`
/// y acumula el tamaño de pila solicitado por las directivas
/// `#stack`, el cual consulta el driver al finalizar.
pub struct Lexer {
    inputs: Vec<Input>,
    stack_size: u32,
}

impl Lexer {
    /// Crea un lexer a partir del texto fuente completo. El directorio
    /// es la base para resolver rutas relativas de `#include`.
    pub fn new<S: Into<String>, P: Into<PathBuf>>(source: S, directory: P) -> Self {
        Lexer {
            inputs: vec![Input {
                chars: source.into().chars().collect(),
                index: 0,
                position: Position::default(),
                directory: directory.into(),
            }],
            stack_size: 0,
        }
    }

    /// Tamaño de pila solicitado por `#stack`, 0 si no hubo directiva.
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    fn position(&self) -> Position {
        match self.inputs.last() {
            Some(input) => input.position,
            None => Position::default(),
        }
    }

    /// Observa el siguiente carácter, descartando entradas agotadas.
    fn peek_char(&mut self) -> Option<char> {
        loop {
            let input = self.inputs.last()?;
            if input.index < input.chars.len() {
                return Some(input.chars[input.index]);
            }

            // EOF de la entrada actual, se regresa a la anterior
            self.inputs.pop();
        }
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        let input = self.inputs.last_mut().unwrap();
        input.index += 1;
        input.position = input.position.after(c);
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.next_char();
            true
        } else {
            false
        }
    }

    /// Consume espacios, comentarios y directivas; el siguiente
    /// carácter visible inicia un token.
    fn skip_trivia(&mut self) -> Compile<()> {
        loop {
            match self.peek_char() {
                Some('#') if Lexer::position(self).column() == 1 => {
                    self.parse_directive()?;
                }
                Some(c) if c.is_ascii_whitespace() => {
                    self.next_char();
                }
                Some('/') => {
                    let position = Lexer::position(self);
                    let input = self.inputs.last().unwrap();
                    match input.chars.get(input.index + 1).copied() {
                        Some('/') => {
                            while let Some(c) = self.peek_char() {
                                if c == '\n' {
                                    break;
                                }
                                self.next_char();
                            }
                        }
                        Some('*') => {
                            self.next_char();
                            self.next_char();
                            loop {
                                match self.next_char() {
                                    Some('*') if self.peek_char() == Some('/') => {
                                        self.next_char();
                                        break;
                                    }
                                    Some(_) => continue,
                                    None => {
                                        return Err(syntax("Unterminated comment", position))
                                    }
                                }
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Procesa una línea de directiva completa.
    fn parse_directive(&mut self) -> Compile<()> {
        let position = Lexer::position(self);

        let mut line = String::new();
        while let Some(c) = self.peek_char() {
            if c == '\n' {
                break;
            }
            line.push(self.next_char().unwrap());
        }

        let line = line.trim_end_matches('\r');
        let (directive, param) = match line.find(' ') {
            Some(split) => (&line[..split], line[split..].trim()),
            None => (line, ""),
        };

        match directive {
            "#stack" => {
                if let Some(raised) = param.strip_prefix('^') {
                    // Con el prefijo "^" solo se permite crecer
                    let new_stack_size = raised.trim().parse::<u32>().unwrap_or(0);
                    if self.stack_size < new_stack_size {
                        self.stack_size = new_stack_size;
                    }
                } else {
                    self.stack_size = param.parse::<u32>().unwrap_or(0);
                }
            }
            "#include" => {
                let path = param.trim_matches('"');
                if path.is_empty() || !param.starts_with('"') || !param.ends_with('"') {
                    return Err(syntax("Malformed include directive", position));
                }

                self.push_include(Path::new(path), position)?;
            }
            _ => {
                eprintln!("warning: Compiler directive \"{}\" cannot be resolved", directive);
            }
        }

        Ok(())
    }

    fn push_include(&mut self, path: &Path, position: Position) -> Compile<()> {
        let directory = &self.inputs.last().unwrap().directory;
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            directory.join(path)
        };

        let text = fs::read_to_string(&resolved).map_err(|error| {
            syntax(
                format!("Cannot open include file \"{}\": {}", resolved.display(), error),
                position,
            )
        })?;

        let directory = resolved
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        self.inputs.push(Input {
            chars: text.chars().collect(),
            index: 0,
            position: Position::default(),
            directory,
        });

        Ok(())
    }

    /// Resuelve un escape después del `\` inicial; produce un byte.
    fn lex_escape(&mut self, position: Position) -> Compile<u8> {
        let c = self
            .next_char()
            .ok_or_else(|| syntax("Unterminated escape sequence", position))?;

        let byte = match c {
            'n' => b'\n',
            't' => b'\t',
            'r' => b'\r',
            'b' => 0x08,
            'f' => 0x0C,
            '\\' => b'\\',
            '"' => b'"',
            '\'' => b'\'',
            '0'..='7' => {
                let mut value = c.to_digit(8).unwrap();
                for _ in 0..2 {
                    match self.peek_char() {
                        Some(digit @ '0'..='7') => {
                            self.next_char();
                            value = value * 8 + digit.to_digit(8).unwrap();
                        }
                        _ => break,
                    }
                }

                if value > 0xFF {
                    return Err(syntax("Escape sequence out of bounds", position));
                }

                value as u8
            }
            _ => return Err(syntax(format!("Bad escape sequence '\\{}'", c), position)),
        };

        Ok(byte)
    }

    fn lex_string(&mut self, position: Position) -> Compile<Token> {
        let mut value = String::new();

        loop {
            match self.next_char() {
                Some('"') => return Ok(Token::StringLiteral(value)),
                Some('\n') | None => {
                    return Err(syntax("Unterminated string literal", position))
                }
                Some('\\') => value.push(self.lex_escape(position)? as char),
                Some(c) => value.push(c),
            }
        }
    }

    fn lex_char(&mut self, position: Position) -> Compile<Token> {
        let mut value: u32 = 0;
        let mut size: u8 = 0;

        loop {
            match self.next_char() {
                Some('\'') => break,
                Some('\n') | None => {
                    return Err(syntax("Unterminated character literal", position))
                }
                Some(c) => {
                    let byte = match c {
                        '\\' => self.lex_escape(position)?,
                        c if (c as u32) <= 0xFF => c as u8,
                        _ => return Err(syntax("Bad character in character literal", position)),
                    };

                    if size == 4 {
                        return Err(syntax("Character literal is too long", position));
                    }

                    // Los bytes se interpretan en orden little-endian
                    value |= (byte as u32) << (8 * size as u32);
                    size += 1;
                }
            }
        }

        if size == 0 {
            return Err(syntax("Empty character literal", position));
        }

        Ok(Token::CharLiteral { value, size })
    }

    /// Intenta construir el siguiente token.
    fn lex(&mut self) -> Compile<Option<Located<Token>>> {
        use Token::*;

        self.skip_trivia()?;

        let position = Lexer::position(self);
        let c = match self.next_char() {
            Some(c) => c,
            None => return Ok(None),
        };

        let token = match c {
            '=' if self.eat('=') => Equal,
            '=' => Assign,
            '+' => Plus,
            '-' => Minus,
            '*' => Star,
            '/' => Slash,
            '%' => Percent,
            '<' if self.eat('<') => ShiftLeft,
            '<' if self.eat('=') => LessOrEqual,
            '<' => Less,
            '>' if self.eat('>') => ShiftRight,
            '>' if self.eat('=') => GreaterOrEqual,
            '>' => Greater,
            '!' if self.eat('=') => NotEqual,
            '&' if self.eat('&') => LogAnd,
            '&' => Ampersand,
            '|' if self.eat('|') => LogOr,
            '(' => OpenParen,
            ')' => CloseParen,
            '[' => OpenBracket,
            ']' => CloseBracket,
            '{' => OpenCurly,
            '}' => CloseCurly,
            ',' => Comma,
            ';' => Semicolon,
            ':' => Colon,

            '"' => self.lex_string(position)?,
            '\'' => self.lex_char(position)?,

            c if c.is_ascii_digit() => {
                let mut value = c.to_digit(10).unwrap() as u64;
                while let Some(digit) = self.peek_char().and_then(|c| c.to_digit(10)) {
                    self.next_char();
                    value = value * 10 + digit as u64;
                    if value > u32::MAX as u64 {
                        return Err(syntax("Integer literal overflow", position));
                    }
                }

                IntLiteral(value as u32)
            }

            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = c.to_string();
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(self.next_char().unwrap());
                    } else {
                        break;
                    }
                }

                match self::Keyword::from_str(&word) {
                    Ok(keyword) => Keyword(keyword),
                    Err(_) => Id(word),
                }
            }

            c => {
                return Err(syntax(
                    format!("Bad character {:?} in input stream", c),
                    position,
                ))
            }
        };

        Ok(Some(Located::at(token, position)))
    }
}

impl Iterator for Lexer {
    type Item = Compile<Located<Token>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lex() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(error) => Some(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        Lexer::new(source, ".")
            .map(|token| token.unwrap().into_inner())
            .collect()
    }

    fn fails(source: &str) {
        let failed = Lexer::new(source, ".").any(|token| token.is_err());
        assert!(failed, "lexer accepted bad input: {:?}", source);
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            tokens("uint8 Main while whiles"),
            vec![
                Token::Keyword(Keyword::Uint8),
                Token::Id("Main".to_string()),
                Token::Keyword(Keyword::While),
                Token::Id("whiles".to_string()),
            ]
        );
    }

    #[test]
    fn operators_use_maximal_munch() {
        assert_eq!(
            tokens("a << b <= c < d"),
            vec![
                Token::Id("a".to_string()),
                Token::ShiftLeft,
                Token::Id("b".to_string()),
                Token::LessOrEqual,
                Token::Id("c".to_string()),
                Token::Less,
                Token::Id("d".to_string()),
            ]
        );
    }

    #[test]
    fn comments_are_discarded() {
        assert_eq!(
            tokens("a // rest of line\n/* block\n */ b"),
            vec![Token::Id("a".to_string()), Token::Id("b".to_string())]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            tokens(r#""a\tb\110\n""#),
            vec![Token::StringLiteral("a\tbH\n".to_string())]
        );

        fails("\"sin cierre");
        fails(r#""\400""#);
    }

    #[test]
    fn char_literals_are_little_endian() {
        assert_eq!(
            tokens("'A' 'AB'"),
            vec![
                Token::CharLiteral { value: 65, size: 1 },
                Token::CharLiteral {
                    value: 0x4241,
                    size: 2
                },
            ]
        );

        fails("'ABCDE'");
        fails("''");
    }

    #[test]
    fn stack_directive() {
        let mut lexer = Lexer::new("#stack 4096\n#stack ^100\nuint8", ".");
        while lexer.next().is_some() {}
        assert_eq!(lexer.stack_size(), 4096);

        let mut lexer = Lexer::new("#stack 100\n#stack ^4096\n", ".");
        while lexer.next().is_some() {}
        assert_eq!(lexer.stack_size(), 4096);

        let mut lexer = Lexer::new("#stack 4096\n#stack 100\n", ".");
        while lexer.next().is_some() {}
        assert_eq!(lexer.stack_size(), 100);
    }

    #[test]
    fn hash_inside_line_is_not_a_directive() {
        fails("a #stack 10");
    }

    #[test]
    fn integer_overflow_is_rejected() {
        assert_eq!(tokens("4294967295"), vec![Token::IntLiteral(u32::MAX)]);
        fails("4294967296");
    }
}
