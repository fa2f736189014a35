//! 最小限のHTMLページ

use crate::types::LedgerOutcome;

/// 結果ページに出す値
pub struct ResultView<'a> {
    pub filename: &'a str,
    pub label: &'a str,
    pub ledger: &'a LedgerOutcome,
    pub impact_count: u64,
}

pub fn upload_form() -> String {
    r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>TB X-ray classifier</title></head>
<body>
<h1>Chest X-ray classification</h1>
<form action="/predict" method="post" enctype="multipart/form-data">
  <input type="file" name="file" accept="image/*" required>
  <button type="submit">Predict</button>
</form>
</body>
</html>
"#
    .to_string()
}

pub fn result_page(view: &ResultView<'_>) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Prediction result</title></head>
<body>
<h1>Prediction result</h1>
<img src="{preview}" alt="uploaded image" width="300">
<table>
  <tr><th>File</th><td>{filename}</td></tr>
  <tr><th>Prediction</th><td id="prediction">{label}</td></tr>
  <tr><th>Transaction</th><td id="tx-hash">{tx_hash}</td></tr>
  <tr><th>Block</th><td id="block-number">{block}</td></tr>
  <tr><th>Impact count</th><td id="impact-count">{count}</td></tr>
</table>
<a href="/">Classify another image</a>
</body>
</html>
"#,
        preview = escape_html(&preview_path(view.filename)),
        filename = escape_html(view.filename),
        label = escape_html(view.label),
        tx_hash = escape_html(view.ledger.tx_hash_display()),
        block = view.ledger.block_number_display(),
        count = view.impact_count,
    )
}

/// 保存済みアップロードへのURLパス
pub fn preview_path(filename: &str) -> String {
    match url::Url::parse("http://localhost/uploads/") {
        Ok(mut url) => {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(filename);
            }
            url.path().to_string()
        }
        Err(_) => format!("/uploads/{}", filename),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
