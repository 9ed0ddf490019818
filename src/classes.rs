use image::Rgb;

use crate::errors::{Result, WasteSegError};

/// One waste category: display name, overlay color and storage column stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasteClass {
    pub name: String,
    pub color: Rgb<u8>,
    pub column: String,
}

impl WasteClass {
    pub fn new(name: &str, hex_color: &str, column: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            color: parse_hex_color(hex_color)?,
            column: column.to_string(),
        })
    }

    /// Column name in the history table, e.g. `mixed_waste_percent`.
    pub fn percent_column(&self) -> String {
        format!("{}_percent", self.column)
    }
}

/// Ordered class table.
///
/// Position in the table is the model's class index. Every component that
/// needs class names or colors takes a `&ClassTable`; there is no global.
/// Iteration order is also the tie-break order for dominant-class selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable {
    classes: Vec<WasteClass>,
}

impl ClassTable {
    pub fn new(classes: Vec<WasteClass>) -> Result<Self> {
        if classes.is_empty() {
            return Err(WasteSegError::configuration("class table is empty"));
        }

        for (i, class) in classes.iter().enumerate() {
            if classes[..i].iter().any(|c| c.name == class.name) {
                return Err(WasteSegError::configuration(format!(
                    "duplicate class name `{}`",
                    class.name
                )));
            }
            let valid_column = !class.column.is_empty()
                && class
                    .column
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid_column {
                return Err(WasteSegError::configuration(format!(
                    "invalid storage column `{}` for class `{}`",
                    class.column, class.name
                )));
            }
        }

        Ok(Self { classes })
    }

    /// The five categories the bundled model was fine-tuned on.
    pub fn waste_default() -> Self {
        let entries = [
            ("Metal", "#B0B0B0", "metal"),
            ("Mixed waste", "#E95500", "mixed_waste"),
            ("Plastic", "#3498DB", "plastic"),
            ("Paper&Cardboard", "#F7DC6F", "paper_cardboard"),
            ("Wood", "#8E5A2B", "wood"),
        ];
        let classes = entries
            .iter()
            .map(|(name, color, column)| WasteClass {
                name: name.to_string(),
                color: parse_hex_color(color).unwrap_or(Rgb([0, 0, 0])),
                column: column.to_string(),
            })
            .collect();
        Self { classes }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WasteClass> {
        self.classes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.name.as_str())
    }

    pub fn get(&self, index: usize) -> Option<&WasteClass> {
        self.classes.get(index)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.get(index).map(|c| c.name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.name == name)
    }

    pub fn color_of(&self, name: &str) -> Option<Rgb<u8>> {
        self.index_of(name).map(|i| self.classes[i].color)
    }

    /// Resolve user supplied class names, rejecting unknown ones.
    pub fn resolve_names<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>> {
        names
            .iter()
            .map(|n| {
                let n = n.as_ref();
                self.index_of(n)
                    .map(|i| self.classes[i].name.clone())
                    .ok_or_else(|| WasteSegError::Validation {
                        field: "class".to_string(),
                        reason: format!("`{}` is not a known class", n),
                    })
            })
            .collect()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::waste_default()
    }
}

/// `#RRGGBB` (or `RRGGBB`) to an RGB pixel.
pub fn parse_hex_color(hex: &str) -> Result<Rgb<u8>> {
    let digits = hex.strip_prefix('#').unwrap_or(hex);
    let invalid = || WasteSegError::configuration(format!("invalid hex color `{}`", hex));

    if digits.len() != 6 {
        return Err(invalid());
    }
    let bytes = hex::decode(digits).map_err(|_| invalid())?;
    Ok(Rgb([bytes[0], bytes[1], bytes[2]]))
}
