//! VT screen emulation.
//!
//! A deterministic state machine that folds PTY output bytes into a
//! fixed-size screen grid plus an unbounded scrollback. Only what the
//! assertion engine needs is modeled: text placement, cursor motion,
//! erasure, scrolling and the alternate screen. Styling (SGR) is parsed
//! and discarded; assertions operate on plain text.

/// Screen emulator for one terminal.
///
/// For a fixed byte stream and initial size, the grid, scrollback and
/// cursor are deterministic functions of the input.
pub struct Emulator {
    rows: usize,
    cols: usize,
    primary: Grid,
    alternate: Grid,
    scrollback: Vec<Vec<char>>,
    alt_active: bool,
    cursor_row: usize,
    cursor_col: usize,
    saved_cursor: (usize, usize),
    state: State,
    params: Vec<u16>,
    private_prefix: bool,
    osc_escape: bool,
    utf8_carry: Vec<u8>,
}

struct Grid {
    cells: Vec<Vec<char>>,
}

impl Grid {
    fn blank(rows: usize, cols: usize) -> Self {
        Self {
            cells: vec![vec![' '; cols]; rows],
        }
    }

    fn clear(&mut self) {
        for row in &mut self.cells {
            row.fill(' ');
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Ground,
    Escape,
    Csi,
    Osc,
    /// After ESC ( or ESC ) — one designator byte to swallow.
    Charset,
}

impl Emulator {
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        let rows = usize::from(rows.max(1));
        let cols = usize::from(cols.max(1));
        Self {
            rows,
            cols,
            primary: Grid::blank(rows, cols),
            alternate: Grid::blank(rows, cols),
            scrollback: Vec::new(),
            alt_active: false,
            cursor_row: 0,
            cursor_col: 0,
            saved_cursor: (0, 0),
            state: State::Ground,
            params: Vec::new(),
            private_prefix: false,
            osc_escape: false,
            utf8_carry: Vec::new(),
        }
    }

    /// Feed raw PTY output. Incomplete UTF-8 sequences at the tail are
    /// carried over to the next call.
    pub fn feed(&mut self, bytes: &[u8]) {
        let input = if self.utf8_carry.is_empty() {
            bytes.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.utf8_carry);
            joined.extend_from_slice(bytes);
            joined
        };
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    for ch in text.chars() {
                        self.process(ch);
                    }
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // Valid prefix always decodes.
                    for ch in std::str::from_utf8(&rest[..valid]).unwrap().chars() {
                        self.process(ch);
                    }
                    match err.error_len() {
                        Some(len) => {
                            self.process(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            self.utf8_carry = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// The on-screen grid only.
    #[must_use]
    pub fn viewable_buffer(&self) -> Vec<Vec<char>> {
        self.active_grid().cells.clone()
    }

    /// Scrollback followed by the on-screen grid.
    #[must_use]
    pub fn buffer(&self) -> Vec<Vec<char>> {
        let mut rows = self.scrollback.clone();
        rows.extend(self.active_grid().cells.iter().cloned());
        rows
    }

    /// Cursor position, clamped to the grid.
    #[must_use]
    pub fn cursor(&self) -> (u16, u16) {
        // Grid dimensions fit in u16 by construction.
        #[allow(clippy::cast_possible_truncation)]
        (
            self.cursor_row.min(self.rows - 1) as u16,
            self.cursor_col.min(self.cols - 1) as u16,
        )
    }

    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        // Grid dimensions fit in u16 by construction.
        #[allow(clippy::cast_possible_truncation)]
        (self.rows as u16, self.cols as u16)
    }

    #[must_use]
    pub fn alternate_screen(&self) -> bool {
        self.alt_active
    }

    /// Propagate a window-size change. Rows scrolled off the top of the
    /// primary screen by a shrink are preserved in scrollback.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        let rows = usize::from(rows.max(1));
        let cols = usize::from(cols.max(1));
        if rows < self.rows {
            let overflow = self.rows - rows;
            for row in self.primary.cells.drain(..overflow) {
                self.scrollback.push(row);
            }
            self.alternate.cells.drain(..overflow);
            self.cursor_row = self.cursor_row.saturating_sub(overflow);
        } else {
            for _ in self.rows..rows {
                self.primary.cells.push(vec![' '; self.cols]);
                self.alternate.cells.push(vec![' '; self.cols]);
            }
        }
        for row in self
            .primary
            .cells
            .iter_mut()
            .chain(self.alternate.cells.iter_mut())
        {
            row.resize(cols, ' ');
        }
        self.rows = rows;
        self.cols = cols;
        self.cursor_row = self.cursor_row.min(rows - 1);
        self.cursor_col = self.cursor_col.min(cols);
    }

    fn active_grid(&self) -> &Grid {
        if self.alt_active {
            &self.alternate
        } else {
            &self.primary
        }
    }

    fn active_grid_mut(&mut self) -> &mut Grid {
        if self.alt_active {
            &mut self.alternate
        } else {
            &mut self.primary
        }
    }

    fn process(&mut self, ch: char) {
        match self.state {
            State::Ground => self.ground(ch),
            State::Escape => self.escape(ch),
            State::Csi => self.csi(ch),
            State::Osc => self.osc(ch),
            State::Charset => self.state = State::Ground,
        }
    }

    fn ground(&mut self, ch: char) {
        match ch {
            '\u{1b}' => self.state = State::Escape,
            '\r' => self.cursor_col = 0,
            '\n' => self.linefeed(),
            '\u{08}' => self.cursor_col = self.cursor_col.saturating_sub(1),
            '\t' => {
                let next_stop = (self.cursor_col / 8 + 1) * 8;
                self.cursor_col = next_stop.min(self.cols - 1);
            }
            '\u{07}' => {}
            ch if (ch as u32) < 0x20 => {}
            ch => self.put(ch),
        }
    }

    fn put(&mut self, ch: char) {
        if self.cursor_col >= self.cols {
            self.cursor_col = 0;
            self.linefeed();
        }
        let row = self.cursor_row.min(self.rows - 1);
        let col = self.cursor_col;
        self.active_grid_mut().cells[row][col] = ch;
        self.cursor_col += 1;
    }

    fn linefeed(&mut self) {
        if self.cursor_row + 1 >= self.rows {
            self.scroll_up();
        } else {
            self.cursor_row += 1;
        }
    }

    fn scroll_up(&mut self) {
        let cols = self.cols;
        if self.alt_active {
            // The alternate screen never extends scrollback.
            self.alternate.cells.remove(0);
            self.alternate.cells.push(vec![' '; cols]);
        } else {
            let top = self.primary.cells.remove(0);
            self.scrollback.push(top);
            self.primary.cells.push(vec![' '; cols]);
        }
    }

    fn escape(&mut self, ch: char) {
        match ch {
            '[' => {
                self.params.clear();
                self.private_prefix = false;
                self.state = State::Csi;
            }
            ']' => {
                self.osc_escape = false;
                self.state = State::Osc;
            }
            '(' | ')' => self.state = State::Charset,
            '7' => {
                self.saved_cursor = (self.cursor_row, self.cursor_col);
                self.state = State::Ground;
            }
            '8' => {
                (self.cursor_row, self.cursor_col) = self.saved_cursor;
                self.state = State::Ground;
            }
            'D' => {
                self.linefeed();
                self.state = State::Ground;
            }
            'E' => {
                self.cursor_col = 0;
                self.linefeed();
                self.state = State::Ground;
            }
            'M' => {
                self.cursor_row = self.cursor_row.saturating_sub(1);
                self.state = State::Ground;
            }
            'c' => {
                self.full_reset();
                self.state = State::Ground;
            }
            _ => self.state = State::Ground,
        }
    }

    fn full_reset(&mut self) {
        self.primary.clear();
        self.alternate.clear();
        self.scrollback.clear();
        self.alt_active = false;
        self.cursor_row = 0;
        self.cursor_col = 0;
        self.saved_cursor = (0, 0);
    }

    fn csi(&mut self, ch: char) {
        match ch {
            '0'..='9' => {
                let digit = ch as u16 - '0' as u16;
                match self.params.last_mut() {
                    Some(param) => *param = param.saturating_mul(10).saturating_add(digit),
                    None => self.params.push(digit),
                }
            }
            ';' => {
                if self.params.is_empty() {
                    self.params.push(0);
                }
                self.params.push(0);
            }
            '?' => self.private_prefix = true,
            // Intermediates and other prefixes are skipped.
            ' '..='/' | ':' | '<' | '=' | '>' => {}
            _ => {
                self.csi_dispatch(ch);
                self.state = State::Ground;
            }
        }
    }

    fn param(&self, index: usize, default: u16) -> u16 {
        match self.params.get(index) {
            Some(&value) if value != 0 => value,
            _ => default,
        }
    }

    fn csi_dispatch(&mut self, action: char) {
        match action {
            'A' => {
                let n = usize::from(self.param(0, 1));
                self.cursor_row = self.cursor_row.saturating_sub(n);
            }
            'B' => {
                let n = usize::from(self.param(0, 1));
                self.cursor_row = (self.cursor_row + n).min(self.rows - 1);
            }
            'C' => {
                let n = usize::from(self.param(0, 1));
                self.cursor_col = (self.cursor_col + n).min(self.cols - 1);
            }
            'D' => {
                let n = usize::from(self.param(0, 1));
                self.cursor_col = self.cursor_col.saturating_sub(n);
            }
            'G' => {
                let col = usize::from(self.param(0, 1));
                self.cursor_col = (col - 1).min(self.cols - 1);
            }
            'd' => {
                let row = usize::from(self.param(0, 1));
                self.cursor_row = (row - 1).min(self.rows - 1);
            }
            'H' | 'f' => {
                let row = usize::from(self.param(0, 1));
                let col = usize::from(self.param(1, 1));
                self.cursor_row = (row - 1).min(self.rows - 1);
                self.cursor_col = (col - 1).min(self.cols - 1);
            }
            'J' => self.erase_display(),
            'K' => self.erase_line(),
            'm' => {}
            'h' | 'l' if self.private_prefix => self.private_mode(action == 'h'),
            's' => self.saved_cursor = (self.cursor_row, self.cursor_col),
            'u' => (self.cursor_row, self.cursor_col) = self.saved_cursor,
            _ => {}
        }
    }

    fn erase_display(&mut self) {
        let mode = self.params.first().copied().unwrap_or(0);
        let row = self.cursor_row.min(self.rows - 1);
        let cols = self.cols;
        let col = self.cursor_col.min(cols);
        match mode {
            0 => {
                let grid = self.active_grid_mut();
                grid.cells[row][col..].fill(' ');
                for line in grid.cells[row + 1..].iter_mut() {
                    line.fill(' ');
                }
            }
            1 => {
                let grid = self.active_grid_mut();
                for line in grid.cells[..row].iter_mut() {
                    line.fill(' ');
                }
                grid.cells[row][..(col + 1).min(cols)].fill(' ');
            }
            2 => self.active_grid_mut().clear(),
            3 => {
                self.active_grid_mut().clear();
                if !self.alt_active {
                    self.scrollback.clear();
                }
            }
            _ => {}
        }
    }

    fn erase_line(&mut self) {
        let mode = self.params.first().copied().unwrap_or(0);
        let row = self.cursor_row.min(self.rows - 1);
        let col = self.cursor_col.min(self.cols);
        let cols = self.cols;
        let line = &mut self.active_grid_mut().cells[row];
        match mode {
            0 => line[col..].fill(' '),
            1 => line[..(col + 1).min(cols)].fill(' '),
            2 => line.fill(' '),
            _ => {}
        }
    }

    fn private_mode(&mut self, set: bool) {
        for &mode in &self.params {
            match mode {
                // 1049 saves the cursor and clears the alternate grid;
                // 47/1047 just switch grids.
                1049 => {
                    if set && !self.alt_active {
                        self.saved_cursor = (self.cursor_row, self.cursor_col);
                        self.alternate.clear();
                        self.alt_active = true;
                        self.cursor_row = 0;
                        self.cursor_col = 0;
                    } else if !set && self.alt_active {
                        self.alt_active = false;
                        (self.cursor_row, self.cursor_col) = self.saved_cursor;
                    }
                }
                47 | 1047 => self.alt_active = set,
                _ => {}
            }
        }
    }

    fn osc(&mut self, ch: char) {
        // Swallow until BEL or ST (ESC \).
        match ch {
            '\u{07}' => self.state = State::Ground,
            '\u{1b}' => self.osc_escape = true,
            '\\' if self.osc_escape => self.state = State::Ground,
            _ => self.osc_escape = false,
        }
    }
}

/// Render a buffer to a single string: cells joined with no separator,
/// rows joined with no separator, trailing blanks preserved.
#[must_use]
pub fn render(buffer: &[Vec<char>]) -> String {
    buffer.iter().flat_map(|row| row.iter()).collect()
}

/// Render a buffer one row per line, for snapshot files.
#[must_use]
pub fn render_lines(buffer: &[Vec<char>]) -> String {
    buffer
        .iter()
        .map(|row| row.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(emulator: &Emulator) -> Vec<String> {
        emulator
            .viewable_buffer()
            .iter()
            .map(|row| row.iter().collect::<String>().trim_end().to_string())
            .collect()
    }

    #[test]
    fn printables_advance_and_wrap() {
        let mut emulator = Emulator::new(2, 4);
        emulator.feed(b"abcdef");
        assert_eq!(text(&emulator), vec!["abcd", "ef"]);
    }

    #[test]
    fn crlf_moves_to_next_row_start() {
        let mut emulator = Emulator::new(3, 10);
        emulator.feed(b"one\r\ntwo");
        assert_eq!(text(&emulator), vec!["one", "two", ""]);
    }

    #[test]
    fn backspace_overwrites() {
        let mut emulator = Emulator::new(1, 10);
        emulator.feed(b"ab\x08c");
        assert_eq!(text(&emulator), vec!["ac"]);
    }

    #[test]
    fn scrolled_lines_enter_scrollback() {
        let mut emulator = Emulator::new(2, 5);
        emulator.feed(b"a\r\nb\r\nc");
        assert_eq!(text(&emulator), vec!["b", "c"]);
        let full = emulator.buffer();
        assert_eq!(full.len(), 3);
        assert_eq!(full[0].iter().collect::<String>().trim_end(), "a");
    }

    #[test]
    fn cursor_movement_and_cup() {
        let mut emulator = Emulator::new(5, 10);
        emulator.feed(b"\x1b[3;4Hx");
        assert_eq!(emulator.viewable_buffer()[2][3], 'x');
        emulator.feed(b"\x1b[2A\x1b[3Dy");
        assert_eq!(emulator.viewable_buffer()[0][1], 'y');
    }

    #[test]
    fn erase_display_from_cursor() {
        let mut emulator = Emulator::new(2, 4);
        emulator.feed(b"aaaa\r\nbbbb");
        emulator.feed(b"\x1b[1;3H\x1b[0J");
        assert_eq!(text(&emulator), vec!["aa", ""]);
    }

    #[test]
    fn erase_line_variants() {
        let mut emulator = Emulator::new(1, 6);
        emulator.feed(b"abcdef");
        emulator.feed(b"\x1b[1;4H\x1b[K");
        assert_eq!(text(&emulator), vec!["abc"]);
        emulator.feed(b"\x1b[2K");
        assert_eq!(text(&emulator), vec![""]);
    }

    #[test]
    fn sgr_is_ignored_for_text() {
        let mut emulator = Emulator::new(1, 10);
        emulator.feed(b"\x1b[1;31mred\x1b[0m");
        assert_eq!(text(&emulator), vec!["red"]);
    }

    #[test]
    fn osc_sequences_are_swallowed() {
        let mut emulator = Emulator::new(1, 20);
        emulator.feed(b"\x1b]0;window title\x07ok");
        emulator.feed(b"\x1b]2;another\x1b\\!");
        assert_eq!(text(&emulator), vec!["ok!"]);
    }

    #[test]
    fn alternate_screen_routes_writes_and_preserves_primary() {
        let mut emulator = Emulator::new(2, 10);
        emulator.feed(b"main");
        emulator.feed(b"\x1b[?1049h");
        assert!(emulator.alternate_screen());
        emulator.feed(b"alt");
        assert_eq!(text(&emulator), vec!["alt", ""]);
        emulator.feed(b"\x1b[?1049l");
        assert!(!emulator.alternate_screen());
        assert_eq!(text(&emulator), vec!["main", ""]);
    }

    #[test]
    fn alternate_screen_does_not_extend_scrollback() {
        let mut emulator = Emulator::new(2, 5);
        emulator.feed(b"\x1b[?1049h");
        emulator.feed(b"a\r\nb\r\nc\r\nd");
        assert_eq!(emulator.buffer().len(), 2);
    }

    #[test]
    fn split_utf8_sequences_reassemble() {
        let mut emulator = Emulator::new(1, 10);
        let bytes = "héllo".as_bytes();
        emulator.feed(&bytes[..2]);
        emulator.feed(&bytes[2..]);
        assert_eq!(text(&emulator), vec!["héllo"]);
    }

    #[test]
    fn deterministic_for_a_fixed_stream() {
        let stream: &[u8] = b"one\r\ntwo\x1b[1;1Hx\x1b[K\r\nthree\x1b[?1049halt\x1b[?1049l";
        let mut first = Emulator::new(4, 12);
        let mut second = Emulator::new(4, 12);
        first.feed(stream);
        // Same bytes, different chunking.
        for chunk in stream.chunks(3) {
            second.feed(chunk);
        }
        assert_eq!(first.viewable_buffer(), second.viewable_buffer());
        assert_eq!(first.buffer(), second.buffer());
        assert_eq!(first.cursor(), second.cursor());
    }

    #[test]
    fn render_concatenates_without_separators() {
        let buffer = vec![vec!['a', 'b', ' '], vec!['c', ' ', ' ']];
        assert_eq!(render(&buffer), "ab c  ");
        assert_eq!(render_lines(&buffer), "ab \nc  ");
    }

    #[test]
    fn resize_shrink_moves_top_rows_to_scrollback() {
        let mut emulator = Emulator::new(3, 5);
        emulator.feed(b"a\r\nb\r\nc");
        emulator.resize(2, 5);
        assert_eq!(text(&emulator), vec!["b", "c"]);
        assert_eq!(emulator.buffer().len(), 3);
    }
}
