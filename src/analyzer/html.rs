//! HTML documents, queried with CSS selectors

use super::charset::{decode, Declared};
use super::{AnalyzeError, Document};
use crate::rule::Action;
use scraper::{ElementRef, Html, Selector};

/// A parsed HTML page
pub struct HtmlDocument {
    html: Html,
    raw: String,
}

impl HtmlDocument {
    /// Parses a payload, decoding it with the charset of `content_type` or the page's
    /// own `<meta charset>`
    pub fn parse(bytes: &[u8], content_type: &str) -> Self {
        let raw = decode(bytes, content_type, Declared::HtmlMeta);
        Self {
            html: Html::parse_document(&raw),
            raw,
        }
    }

    fn is_root(&self, node: ElementRef<'_>) -> bool {
        node.id() == self.html.root_element().id()
    }
}

fn compile(selector: &str) -> Result<Selector, AnalyzeError> {
    Selector::parse(selector).map_err(|e| AnalyzeError::Selector {
        selector: selector.to_string(),
        message: format!("{:?}", e),
    })
}

fn text_of(node: ElementRef<'_>) -> String {
    node.text().collect::<String>().trim().to_string()
}

impl Document for HtmlDocument {
    type Node<'a> = ElementRef<'a>;

    fn root(&self) -> ElementRef<'_> {
        self.html.root_element()
    }

    fn select<'a>(
        &'a self,
        node: ElementRef<'a>,
        selector: &str,
    ) -> Result<Vec<ElementRef<'a>>, AnalyzeError> {
        let selector = compile(selector)?;
        Ok(node.select(&selector).collect())
    }

    fn raw(&self, node: ElementRef<'_>) -> String {
        if self.is_root(node) {
            self.raw.clone()
        } else {
            node.html()
        }
    }

    fn title(&self, node: ElementRef<'_>) -> String {
        // "title" always compiles
        match Selector::parse("title") {
            Ok(selector) => node.select(&selector).next().map(text_of).unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    fn act(&self, node: ElementRef<'_>, action: &Action) -> String {
        match action {
            Action::Text => text_of(node),
            Action::Html => node.inner_html(),
            Action::Attr(name) => node.value().attr(name).unwrap_or_default().to_string(),
        }
    }
}
