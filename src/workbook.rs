//! Workbook data model and the loader that turns an uploaded binary into sheets of raw cells.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use calamine::{Data, Dimensions, Ods, Reader, Xls, Xlsb, Xlsx};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use uuid::Uuid;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// A raw cell value as read from the file, before any typing rules are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Bool(bool),
    /// A formula that evaluated to an error such as `#DIV/0!`.
    Error(String),
    Empty,
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Inclusive rectangle of merged cells; the top-left cell holds the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpan {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl MergeSpan {
    pub fn contains(&self, row: u32, col: u32) -> bool {
        (self.top..=self.bottom).contains(&row) && (self.left..=self.right).contains(&col)
    }

    pub fn anchor(&self) -> (u32, u32) {
        (self.top, self.left)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub row: u32,
    pub col: u32,
    pub value: CellValue,
    pub merge: Option<MergeSpan>,
}

/// One worksheet: a rectangular, row-major grid addressed from (0, 0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub index: usize,
    rows: Vec<Vec<Cell>>,
    width: u32,
}

static EMPTY: CellValue = CellValue::Empty;

impl Sheet {
    /// Builds a sheet from ragged rows, padding short rows with empty cells.
    pub fn from_values(
        name: impl Into<String>,
        index: usize,
        values: Vec<Vec<CellValue>>,
    ) -> Self {
        let width = values.iter().map(Vec::len).max().unwrap_or(0) as u32;
        let rows = values
            .into_iter()
            .enumerate()
            .map(|(r, row)| {
                let mut cells: Vec<Cell> = row
                    .into_iter()
                    .enumerate()
                    .map(|(c, value)| Cell {
                        row: r as u32,
                        col: c as u32,
                        value,
                        merge: None,
                    })
                    .collect();
                for c in cells.len() as u32..width {
                    cells.push(Cell {
                        row: r as u32,
                        col: c,
                        value: CellValue::Empty,
                        merge: None,
                    });
                }
                cells
            })
            .collect();

        Self {
            name: name.into(),
            index,
            rows,
            width,
        }
    }

    /// Attaches merge spans to every cell they cover. Spans are clipped to the sheet extent.
    pub fn with_merges(mut self, merges: &[MergeSpan]) -> Self {
        for span in merges {
            let height = span.bottom.saturating_sub(span.top) as usize + 1;
            let covered = self
                .rows
                .iter_mut()
                .skip(span.top as usize)
                .take(height)
                .flatten()
                .filter(|cell| span.contains(cell.row, cell.col));
            for cell in covered {
                cell.merge = Some(*span);
            }
        }
        self
    }

    pub fn height(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn row(&self, row: u32) -> &[Cell] {
        self.rows.get(row as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&Cell> {
        self.rows.get(row as usize)?.get(col as usize)
    }

    pub fn value(&self, row: u32, col: u32) -> &CellValue {
        self.cell(row, col).map(|c| &c.value).unwrap_or(&EMPTY)
    }

    /// Value of a cell after merge propagation: cells inside a merge report the anchor's value.
    pub fn resolved_value(&self, row: u32, col: u32) -> &CellValue {
        match self.cell(row, col) {
            Some(Cell {
                merge: Some(span), ..
            }) => {
                let (r, c) = span.anchor();
                self.value(r, c)
            }
            Some(cell) => &cell.value,
            None => &EMPTY,
        }
    }
}

/// An uploaded workbook. Immutable once loaded and owned by a single pipeline run.
#[derive(Debug, Clone)]
pub struct Workbook {
    upload_id: Uuid,
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new(upload_id: Uuid, sheets: Vec<Sheet>) -> Result<Self> {
        if sheets.is_empty() {
            return Err(PipelineError::EmptyWorkbook);
        }
        Ok(Self { upload_id, sheets })
    }

    pub fn upload_id(&self) -> Uuid {
        self.upload_id
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }
}

/// The raw payload handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub upload_id: Uuid,
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(
        filename: impl Into<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            upload_id: Uuid::new_v4(),
            filename: filename.into(),
            content_type,
            bytes,
        }
    }

    pub fn with_upload_id(mut self, upload_id: Uuid) -> Self {
        self.upload_id = upload_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadsheetFormat {
    Xlsx,
    Xlsb,
    Xls,
    Ods,
}

impl SpreadsheetFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "xlsx" | "xlsm" | "xltx" | "xltm" => Some(Self::Xlsx),
            "xlsb" => Some(Self::Xlsb),
            "xls" | "xla" | "xlt" => Some(Self::Xls),
            "ods" => Some(Self::Ods),
            _ => None,
        }
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel.sheet.macroenabled.12" => Some(Self::Xlsx),
            "application/vnd.ms-excel.sheet.binary.macroenabled.12" => Some(Self::Xlsb),
            "application/vnd.ms-excel" => Some(Self::Xls),
            "application/vnd.oasis.opendocument.spreadsheet" => Some(Self::Ods),
            _ => None,
        }
    }

    fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(ZIP_MAGIC) {
            Some(Self::Xlsx)
        } else if bytes.starts_with(OLE2_MAGIC) {
            Some(Self::Xls)
        } else {
            None
        }
    }

    /// Resolves the format from the filename, the declared content type and finally the bytes.
    pub fn detect(upload: &UploadedFile) -> Option<Self> {
        Path::new(&upload.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
            .or_else(|| {
                mime_guess::from_path(&upload.filename)
                    .iter()
                    .find_map(|mime| Self::from_mime(mime.essence_str()))
            })
            .or_else(|| upload.content_type.as_deref().and_then(Self::from_mime))
            .or_else(|| Self::from_magic(&upload.bytes))
    }
}

/// Streams a cells reader into a [`SheetGrid`], checking the ceiling on the declared
/// dimensions and again on every cell.
macro_rules! stream_cells {
    ($loader:expr, $name:expr, $reader:expr) => {{
        let mut grid = $loader.grid($name, $reader.dimensions())?;
        while let Some(cell) = $reader.next_cell().map_err(unreadable)? {
            let data = Data::from(cell.get_value().clone());
            grid.push(cell.get_position(), cell_value(&data))?;
        }
        grid
    }};
}

pub struct WorkbookLoader {
    max_file_size_bytes: u64,
    max_sheet_cells: u64,
}

impl WorkbookLoader {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            max_file_size_bytes: config.max_file_size_bytes,
            max_sheet_cells: config.max_sheet_cells,
        }
    }

    pub fn load(&self, upload: &UploadedFile) -> Result<Workbook> {
        let size = upload.bytes.len() as u64;
        if size > self.max_file_size_bytes {
            return Err(PipelineError::FileTooLarge(format!(
                "{} bytes exceeds the limit of {} bytes",
                size, self.max_file_size_bytes
            )));
        }
        if size == 0 {
            return Err(PipelineError::UnreadableFile(
                "uploaded file is empty".to_string(),
            ));
        }

        let format = SpreadsheetFormat::detect(upload).ok_or_else(|| {
            PipelineError::UnreadableFile(format!(
                "unsupported spreadsheet format for '{}'",
                upload.filename
            ))
        })?;
        debug!(
            "Loading upload {} ('{}') as {:?}, {} bytes",
            upload.upload_id, upload.filename, format, size
        );

        let cursor = Cursor::new(upload.bytes.as_slice());
        let sheets = match format {
            SpreadsheetFormat::Xlsx => {
                let mut workbook = Xlsx::new(cursor).map_err(unreadable)?;
                workbook.load_merged_regions().map_err(unreadable)?;
                let mut sheets = Vec::new();
                for (index, name) in workbook.sheet_names().into_iter().enumerate() {
                    let merges = workbook
                        .worksheet_merge_cells(&name)
                        .and_then(|res| res.ok())
                        .unwrap_or_default();
                    let mut reader = workbook.worksheet_cells_reader(&name).map_err(unreadable)?;
                    let grid = stream_cells!(self, &name, reader);
                    sheets.push(grid.into_sheet(index, &merge_spans(&merges)));
                }
                sheets
            }
            SpreadsheetFormat::Xlsb => {
                let mut workbook: Xlsb<_> = Xlsb::new(cursor).map_err(unreadable)?;
                let mut sheets = Vec::new();
                for (index, name) in workbook.sheet_names().into_iter().enumerate() {
                    let mut reader = workbook.worksheet_cells_reader(&name).map_err(unreadable)?;
                    let grid = stream_cells!(self, &name, reader);
                    sheets.push(grid.into_sheet(index, &[]));
                }
                sheets
            }
            // calamine only offers whole-range reads for these formats.
            SpreadsheetFormat::Xls => {
                let mut workbook: Xls<_> = Xls::new(cursor).map_err(unreadable)?;
                self.read_ranges(&mut workbook)?
            }
            SpreadsheetFormat::Ods => {
                let mut workbook: Ods<_> = Ods::new(cursor).map_err(unreadable)?;
                self.read_ranges(&mut workbook)?
            }
        };

        info!(
            "Loaded upload {} with {} sheet(s)",
            upload.upload_id,
            sheets.len()
        );
        Workbook::new(upload.upload_id, sheets)
    }

    /// Starts a grid for one sheet, rejecting it up front when its declared extent is over
    /// the cell ceiling.
    fn grid(&self, name: &str, declared: Dimensions) -> Result<SheetGrid> {
        let grid = SheetGrid {
            name: name.to_string(),
            limit: self.max_sheet_cells,
            cells: Vec::new(),
            height: 0,
            width: 0,
        };
        grid.check_extent(u64::from(declared.end.0) + 1, u64::from(declared.end.1) + 1)?;
        Ok(grid)
    }

    fn read_ranges<RS, R>(&self, workbook: &mut R) -> Result<Vec<Sheet>>
    where
        RS: Read + Seek,
        R: Reader<RS>,
        R::Error: std::fmt::Display,
    {
        let names = workbook.sheet_names();
        let mut sheets = Vec::with_capacity(names.len());

        for (index, name) in names.iter().enumerate() {
            let range = workbook.worksheet_range(name).map_err(unreadable)?;
            let declared = Dimensions {
                start: range.start().unwrap_or((0, 0)),
                end: range.end().unwrap_or((0, 0)),
            };
            let mut grid = self.grid(name, declared)?;
            let (top, left) = declared.start;
            for (r, c, data) in range.used_cells() {
                grid.push((top + r as u32, left + c as u32), cell_value(data))?;
            }
            sheets.push(grid.into_sheet(index, &[]));
        }

        Ok(sheets)
    }
}

/// Sparse cells of one sheet, kept until the extent is known to fit under the ceiling.
struct SheetGrid {
    name: String,
    limit: u64,
    cells: Vec<(u32, u32, CellValue)>,
    height: u64,
    width: u64,
}

impl SheetGrid {
    fn check_extent(&self, height: u64, width: u64) -> Result<()> {
        if height * width > self.limit {
            return Err(PipelineError::FileTooLarge(format!(
                "sheet '{}' spans {} cells, exceeding the limit of {}",
                self.name,
                height * width,
                self.limit
            )));
        }
        Ok(())
    }

    fn grow(&mut self, row: u32, col: u32) -> Result<()> {
        let height = self.height.max(u64::from(row) + 1);
        let width = self.width.max(u64::from(col) + 1);
        self.check_extent(height, width)?;
        self.height = height;
        self.width = width;
        Ok(())
    }

    fn push(&mut self, (row, col): (u32, u32), value: CellValue) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        self.grow(row, col)?;
        self.cells.push((row, col, value));
        Ok(())
    }

    fn into_sheet(mut self, index: usize, merges: &[MergeSpan]) -> Sheet {
        for span in merges {
            // Whole-row or whole-column merges are clipped to the cells actually read.
            if self.grow(span.bottom, span.right).is_err() {
                debug!("Sheet '{}': merge {:?} clipped to the sheet extent", self.name, span);
            }
        }
        if self.cells.is_empty() && merges.is_empty() {
            debug!("Sheet '{}' is empty", self.name);
        }

        let mut values = vec![vec![CellValue::Empty; self.width as usize]; self.height as usize];
        for (row, col, value) in self.cells {
            values[row as usize][col as usize] = value;
        }
        Sheet::from_values(self.name, index, values).with_merges(merges)
    }
}

fn merge_spans(dimensions: &[Dimensions]) -> Vec<MergeSpan> {
    dimensions
        .iter()
        .map(|dims| MergeSpan {
            top: dims.start.0,
            left: dims.start.1,
            bottom: dims.end.0,
            right: dims.end.1,
        })
        .collect()
}

fn unreadable<E: std::fmt::Display>(err: E) -> PipelineError {
    PipelineError::UnreadableFile(err.to_string())
}

fn cell_value(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) if s.trim().is_empty() => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(datetime) if !dt.is_duration() => CellValue::Date(datetime.date()),
            _ => CellValue::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) => s
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .map(CellValue::Date)
            .unwrap_or_else(|| CellValue::Text(s.clone())),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Error(e.to_string()),
    }
}
