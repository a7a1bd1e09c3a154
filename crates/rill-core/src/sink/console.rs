//! Sink printing batches as text tables.

use std::io::Write;

use async_trait::async_trait;

use super::{EmitBatch, OutputSink, SinkError};

/// Writes each batch as a bordered table.
///
/// ```text
/// -------------------------------------------
/// Batch: 1 (word_counts, complete)
/// -------------------------------------------
/// +-----+-----+
/// |word |count|
/// +-----+-----+
/// |cat  |1    |
/// +-----+-----+
/// ```
#[derive(Debug)]
pub struct ConsoleSink<W: Write + Send = std::io::Stdout> {
    writer: W,
    max_rows: usize,
    skip_empty: bool,
}

impl ConsoleSink<std::io::Stdout> {
    /// Sink writing to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    /// Sink writing to `writer`, showing at most 20 rows per batch.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            max_rows: 20,
            skip_empty: false,
        }
    }

    /// Sets the number of rows shown per batch.
    #[must_use]
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Omits batches with no rows.
    #[must_use]
    pub fn with_skip_empty(mut self, skip: bool) -> Self {
        self.skip_empty = skip;
        self
    }

    /// Returns the writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn render(&self, batch: &EmitBatch) -> String {
        let headers: Vec<&str> = batch.schema.fields().iter().map(|f| f.name()).collect();
        let shown = &batch.rows[..batch.rows.len().min(self.max_rows)];
        let cells: Vec<Vec<String>> = shown
            .iter()
            .map(|row| (0..headers.len()).map(|i| row.get(i).to_string()).collect())
            .collect();

        let widths: Vec<usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                cells
                    .iter()
                    .map(|r| r[i].chars().count())
                    .chain(std::iter::once(h.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let border = widths.iter().fold(String::from("+"), |mut s, w| {
            s.push_str(&"-".repeat(*w));
            s.push('+');
            s
        });

        let rule = "-".repeat(43);
        let mut out = Vec::with_capacity(cells.len() + 8);
        out.push(rule.clone());
        out.push(format!(
            "Batch: {} ({}, {})",
            batch.batch_id, batch.output, batch.mode
        ));
        out.push(rule);
        out.push(border.clone());
        out.push(line(headers.iter().copied(), &widths));
        out.push(border.clone());
        for row in &cells {
            out.push(line(row.iter().map(String::as_str), &widths));
        }
        out.push(border);
        if batch.rows.len() > shown.len() {
            out.push(format!("only showing top {} rows", shown.len()));
        }
        out.push(String::new());
        out.join("\n")
    }
}

fn line<'a>(values: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let mut s = String::from("|");
    for (v, w) in values.zip(widths) {
        s.push_str(&format!("{v:<w$}|", w = *w));
    }
    s
}

#[async_trait]
impl<W: Write + Send> OutputSink for ConsoleSink<W> {
    fn name(&self) -> &str {
        "console"
    }

    async fn emit(&mut self, batch: &EmitBatch) -> Result<(), SinkError> {
        if self.skip_empty && batch.is_empty() {
            return Ok(());
        }
        let text = self.render(batch);
        writeln!(self.writer, "{text}")?;
        self.writer.flush()?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
