use {
    super::{is_spirv, SpirvError},
    rspirv::{
        binary::{parse_words, Consumer, ParseAction},
        dr::{self, Operand},
        spirv::{Op, Word},
    },
    std::collections::HashMap,
};

const DEBUG_INFO_SET: &str = "NonSemantic.Shader.DebugInfo.100";

/// Instruction numbers of the `NonSemantic.Shader.DebugInfo.100` set.
mod debug_info {
    pub const SOURCE: u32 = 35;
    pub const SOURCE_CONTINUED: u32 = 102;
    pub const LINE: u32 = 103;
    pub const NO_LINE: u32 = 104;
}

/// Where in the original source an instruction came from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,

    /// Text of the source line when the module embeds its source.
    pub source: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LineInfo {
    file: Option<Word>,
    line: u32,
    column: u32,
}

#[derive(Clone, Copy, Debug)]
struct LineMark {
    position: u32,
    info: Option<LineInfo>,
}

#[derive(Clone, Debug)]
struct SourceText {
    file: Option<Word>,
    text: String,
}

/// Line table of a shader module.
///
/// Instruction ids in error records are zero-based positions of instructions
/// in the original module, header excluded.
#[derive(Clone, Debug, Default)]
pub struct DebugLineTable {
    marks: Vec<LineMark>,
    strings: HashMap<Word, String>,
    sources: Vec<SourceText>,
}

impl DebugLineTable {
    pub fn parse(words: &[u32]) -> Result<Self, SpirvError> {
        if !is_spirv(words) {
            return Err(SpirvError::NotSpirv);
        }

        let mut consumer = LineConsumer::default();
        parse_words(words, &mut consumer).map_err(|err| SpirvError::Parse {
            message: format!("{:?}", err),
        })?;
        Ok(consumer.table)
    }

    pub fn is_empty(&self) -> bool {
        self.marks.iter().all(|mark| mark.info.is_none())
    }

    /// Finds location of the instruction at `position`.
    ///
    /// The closest line directive preceding the instruction wins, unless a
    /// `OpNoLine`, `DebugNoLine` or the end of a function cleared it.
    pub fn find(&self, position: u32) -> Option<SourceLocation> {
        let index = self.marks.partition_point(|mark| mark.position < position);
        let info = self.marks[..index].last()?.info?;

        let file = info.file.and_then(|id| self.strings.get(&id)).cloned();
        let source = self.source_line(info.file, info.line);
        Some(SourceLocation {
            file,
            line: info.line,
            column: info.column,
            source,
        })
    }

    /// Text of `line` in the embedded source of `file`.
    fn source_line(&self, file: Option<Word>, line: u32) -> Option<String> {
        let file_name = file.and_then(|id| self.strings.get(&id));
        let source = self
            .sources
            .iter()
            .find(|source| {
                (file.is_some() && source.file == file)
                    || source.file.and_then(|id| self.strings.get(&id)) == file_name
            })
            .or_else(|| self.sources.first())?;

        let lines: Vec<&str> = source.text.lines().collect();
        let (directive_line, directive_index) =
            closest_line_directive(&lines, file_name.map(String::as_str), line)
                .unwrap_or((1, None));

        let first = directive_index.map_or(0, |index| index + 1);
        let index = first + line.saturating_sub(directive_line) as usize;
        lines.get(index).map(|text| text.trim_end().to_owned())
    }
}

/// Finds `#line N ["file"]` directive with the greatest `N` not exceeding
/// `line`. Directives naming another file are skipped.
///
/// Inlining reorders directives so every one has to be considered.
fn closest_line_directive(
    lines: &[&str],
    file: Option<&str>,
    line: u32,
) -> Option<(u32, Option<usize>)> {
    let mut best: Option<(u32, Option<usize>)> = None;

    for (index, text) in lines.iter().enumerate() {
        let rest = match text.trim_start().strip_prefix("#line") {
            Some(rest) => rest,
            None => continue,
        };
        let mut parts = rest.split_whitespace();
        let number: u32 = match parts.next().and_then(|n| n.parse().ok()) {
            Some(number) => number,
            None => continue,
        };
        if let (Some(name), Some(file)) = (parts.next(), file) {
            if name.trim_matches('"') != file {
                continue;
            }
        }
        if number <= line && best.map_or(true, |(b, _)| number >= b) {
            best = Some((number, Some(index)));
        }
    }

    best
}

#[derive(Default)]
struct LineConsumer {
    table: DebugLineTable,
    position: u32,
    debug_info_set: Option<Word>,
    constants: HashMap<Word, u32>,
    debug_sources: HashMap<Word, Word>,
}

impl LineConsumer {
    fn mark(&mut self, info: Option<LineInfo>) {
        self.table.marks.push(LineMark {
            position: self.position,
            info,
        });
    }

    fn push_source(&mut self, file: Option<Word>, text: String) {
        self.table.sources.push(SourceText { file, text });
    }

    fn continue_source(&mut self, text: &str) {
        if let Some(last) = self.table.sources.last_mut() {
            last.text.push_str(text);
        }
    }

    fn ext_inst(&mut self, inst: &dr::Instruction) {
        let set = id_operand(&inst.operands, 0);
        if set.is_none() || set != self.debug_info_set {
            return;
        }
        let opcode = match inst.operands.get(1) {
            Some(Operand::LiteralExtInstInteger(opcode)) => *opcode,
            _ => return,
        };

        match opcode {
            debug_info::SOURCE => {
                let file = id_operand(&inst.operands, 2);
                if let (Some(result), Some(file)) = (inst.result_id, file) {
                    self.debug_sources.insert(result, file);
                }
                if let Some(text) = id_operand(&inst.operands, 3)
                    .and_then(|id| self.table.strings.get(&id))
                    .cloned()
                {
                    self.push_source(file, text);
                }
            }
            debug_info::SOURCE_CONTINUED => {
                if let Some(text) = id_operand(&inst.operands, 2)
                    .and_then(|id| self.table.strings.get(&id))
                    .cloned()
                {
                    self.continue_source(&text);
                }
            }
            debug_info::LINE => {
                let file = id_operand(&inst.operands, 2)
                    .map(|id| self.debug_sources.get(&id).copied().unwrap_or(id));
                let line = self.constant(&inst.operands, 3);
                let column = self.constant(&inst.operands, 5);
                if let Some(line) = line {
                    self.mark(Some(LineInfo {
                        file,
                        line,
                        column: column.unwrap_or(0),
                    }));
                }
            }
            debug_info::NO_LINE => self.mark(None),
            _ => {}
        }
    }

    fn constant(&self, operands: &[Operand], index: usize) -> Option<u32> {
        id_operand(operands, index).and_then(|id| self.constants.get(&id).copied())
    }
}

fn id_operand(operands: &[Operand], index: usize) -> Option<Word> {
    match operands.get(index) {
        Some(Operand::IdRef(id)) => Some(*id),
        _ => None,
    }
}

fn literal_operand(operands: &[Operand], index: usize) -> Option<u32> {
    match operands.get(index) {
        Some(Operand::LiteralInt32(value)) => Some(*value),
        _ => None,
    }
}

fn string_operand(operands: &[Operand], index: usize) -> Option<&str> {
    match operands.get(index) {
        Some(Operand::LiteralString(value)) => Some(value.as_str()),
        _ => None,
    }
}

impl Consumer for LineConsumer {
    fn initialize(&mut self) -> ParseAction {
        ParseAction::Continue
    }

    fn finalize(&mut self) -> ParseAction {
        ParseAction::Continue
    }

    fn consume_header(&mut self, _header: dr::ModuleHeader) -> ParseAction {
        ParseAction::Continue
    }

    fn consume_instruction(&mut self, inst: dr::Instruction) -> ParseAction {
        match inst.class.opcode {
            Op::String => {
                if let (Some(id), Some(text)) =
                    (inst.result_id, string_operand(&inst.operands, 0))
                {
                    self.table.strings.insert(id, text.to_owned());
                }
            }
            Op::ExtInstImport => {
                if string_operand(&inst.operands, 0) == Some(DEBUG_INFO_SET) {
                    self.debug_info_set = inst.result_id;
                }
            }
            Op::Constant => {
                if let (Some(id), Some(value)) =
                    (inst.result_id, literal_operand(&inst.operands, 0))
                {
                    self.constants.insert(id, value);
                }
            }
            Op::Source => {
                let file = id_operand(&inst.operands, 2);
                if let Some(text) = string_operand(&inst.operands, 3) {
                    self.push_source(file, text.to_owned());
                }
            }
            Op::SourceContinued => {
                if let Some(text) = string_operand(&inst.operands, 0) {
                    let text = text.to_owned();
                    self.continue_source(&text);
                }
            }
            Op::Line => {
                if let (Some(line), Some(column)) = (
                    literal_operand(&inst.operands, 1),
                    literal_operand(&inst.operands, 2),
                ) {
                    self.mark(Some(LineInfo {
                        file: id_operand(&inst.operands, 0),
                        line,
                        column,
                    }));
                }
            }
            Op::NoLine | Op::FunctionEnd => self.mark(None),
            Op::ExtInst => self.ext_inst(&inst),
            _ => {}
        }
        self.position += 1;
        ParseAction::Continue
    }
}
