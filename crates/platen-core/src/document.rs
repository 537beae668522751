//! Document and settings value objects.
//!
//! A [`Document`] is an opaque, serializable payload the pipeline passes
//! through unmodified: the global layout settings plus one entry per HTML
//! object to render. Settings flatten into the engine's dotted key/value
//! names right before they are applied.

use serde::{Deserialize, Serialize};

/// Paper orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

impl Orientation {
    fn as_setting(&self) -> &'static str {
        match self {
            Orientation::Portrait => "Portrait",
            Orientation::Landscape => "Landscape",
        }
    }
}

/// Output color mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorMode {
    #[default]
    Color,
    Grayscale,
}

impl ColorMode {
    fn as_setting(&self) -> &'static str {
        match self {
            ColorMode::Color => "Color",
            ColorMode::Grayscale => "Grayscale",
        }
    }
}

/// Document-wide layout settings.
///
/// Margins are given as engine-style dimension strings ("10mm", "0.5in").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Named paper size ("A4", "Letter", ...).
    pub paper_size: String,
    pub orientation: Orientation,
    pub color_mode: ColorMode,
    pub dpi: u32,
    pub margin_top: String,
    pub margin_bottom: String,
    pub margin_left: String,
    pub margin_right: String,
    /// Pass-through settings applied verbatim after the structured ones.
    pub extra: Vec<(String, String)>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            paper_size: "A4".to_string(),
            orientation: Orientation::Portrait,
            color_mode: ColorMode::Color,
            dpi: 96,
            margin_top: "10mm".to_string(),
            margin_bottom: "10mm".to_string(),
            margin_left: "10mm".to_string(),
            margin_right: "10mm".to_string(),
            extra: Vec::new(),
        }
    }
}

impl GlobalSettings {
    /// Flatten into the engine's dotted setting names, in application order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("size.paperSize".to_string(), self.paper_size.clone()),
            ("orientation".to_string(), self.orientation.as_setting().to_string()),
            ("colorMode".to_string(), self.color_mode.as_setting().to_string()),
            ("dpi".to_string(), self.dpi.to_string()),
            ("margin.top".to_string(), self.margin_top.clone()),
            ("margin.bottom".to_string(), self.margin_bottom.clone()),
            ("margin.left".to_string(), self.margin_left.clone()),
            ("margin.right".to_string(), self.margin_right.clone()),
        ];
        pairs.extend(self.extra.iter().cloned());
        pairs
    }
}

/// Per-object settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSettings {
    /// Text encoding of the HTML content.
    pub encoding: String,
    /// Whether to run the object's JavaScript before rendering.
    pub enable_javascript: bool,
    /// Pass-through settings applied verbatim after the structured ones.
    pub extra: Vec<(String, String)>,
}

impl Default for ObjectSettings {
    fn default() -> Self {
        Self {
            encoding: "utf-8".to_string(),
            enable_javascript: true,
            extra: Vec::new(),
        }
    }
}

impl ObjectSettings {
    /// Flatten into the engine's dotted setting names, in application order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("web.defaultEncoding".to_string(), self.encoding.clone()),
            (
                "web.enableJavascript".to_string(),
                if self.enable_javascript { "true" } else { "false" }.to_string(),
            ),
        ];
        pairs.extend(self.extra.iter().cloned());
        pairs
    }
}

/// One HTML object to render into the output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentObject {
    pub settings: ObjectSettings,
    /// Raw HTML content, already in `settings.encoding`.
    pub content: Vec<u8>,
}

impl DocumentObject {
    /// Object from an HTML string (UTF-8).
    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            settings: ObjectSettings::default(),
            content: html.into().into_bytes(),
        }
    }
}

/// A conversion request payload: global settings plus content objects.
///
/// A document with no objects is the empty request; the frontend resolves it
/// immediately without touching the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub global: GlobalSettings,
    pub objects: Vec<DocumentObject>,
}

impl Document {
    pub fn new(global: GlobalSettings) -> Self {
        Self {
            global,
            objects: Vec::new(),
        }
    }

    /// Single-object document from an HTML string, default settings.
    pub fn from_html(html: impl Into<String>) -> Self {
        let mut doc = Self::default();
        doc.objects.push(DocumentObject::from_html(html));
        doc
    }

    pub fn add_object(&mut self, object: DocumentObject) -> &mut Self {
        self.objects.push(object);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_pairs_cover_structured_fields() {
        let mut settings = GlobalSettings::default();
        settings.paper_size = "Letter".to_string();
        settings.orientation = Orientation::Landscape;
        settings.extra.push(("outline".to_string(), "true".to_string()));

        let pairs = settings.pairs();
        assert!(pairs.contains(&("size.paperSize".to_string(), "Letter".to_string())));
        assert!(pairs.contains(&("orientation".to_string(), "Landscape".to_string())));
        // Extras come after the structured settings so they can override.
        assert_eq!(pairs.last().unwrap().0, "outline");
    }

    #[test]
    fn test_empty_document() {
        assert!(Document::default().is_empty());
        assert!(!Document::from_html("<p>hi</p>").is_empty());
    }

    #[test]
    fn test_object_pairs_encode_javascript_flag() {
        let mut settings = ObjectSettings::default();
        settings.enable_javascript = false;
        let pairs = settings.pairs();
        assert!(pairs.contains(&("web.enableJavascript".to_string(), "false".to_string())));
    }
}
