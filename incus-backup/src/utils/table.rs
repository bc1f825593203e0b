//! Plain-text column tables for previews and listings.

/// Left-aligned columns separated by two spaces. Trailing padding is
/// trimmed from every line.
pub fn render(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    let mut out = String::new();
    let mut push_line = |cells: Vec<&str>| {
        let mut line = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                line.push_str("  ");
            }
            line.push_str(cell);
            let width = widths.get(i).copied().unwrap_or(0);
            for _ in cell.chars().count()..width {
                line.push(' ');
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    };

    push_line(headers.to_vec());
    for row in rows {
        push_line(row.iter().map(String::as_str).collect());
    }
    out
}

/// `-` for empty cells.
pub fn cell(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_align() {
        let rows = vec![
            vec!["instance".to_string(), "web".to_string()],
            vec!["volume".to_string(), cell("")],
        ];
        let out = render(&["TYPE", "NAME"], &rows);
        assert_eq!(out, "TYPE      NAME\ninstance  web\nvolume    -\n");
    }
}
