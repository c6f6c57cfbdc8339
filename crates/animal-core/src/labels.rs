//! The closed label universe and the fixed business rules over it.
//!
//! Gender preference sets and forbidden pairs are compile-time constants:
//! nothing in the process can mutate them after startup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Number of labels a direct classifier must emit.
pub const LABEL_COUNT: usize = 11;

/// Animal archetype label.
///
/// Variant order is the canonical label order: classifier outputs are zipped
/// against it and the prototype registry iterates in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Animal {
    Bear,
    Snake,
    Cat,
    Dog,
    Wolf,
    Dinosaur,
    Squirrel,
    Rabbit,
    Tiger,
    Turtle,
    Deer,
}

impl Animal {
    pub const ALL: [Animal; LABEL_COUNT] = [
        Animal::Bear,
        Animal::Snake,
        Animal::Cat,
        Animal::Dog,
        Animal::Wolf,
        Animal::Dinosaur,
        Animal::Squirrel,
        Animal::Rabbit,
        Animal::Tiger,
        Animal::Turtle,
        Animal::Deer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Animal::Bear => "bear",
            Animal::Snake => "snake",
            Animal::Cat => "cat",
            Animal::Dog => "dog",
            Animal::Wolf => "wolf",
            Animal::Dinosaur => "dinosaur",
            Animal::Squirrel => "squirrel",
            Animal::Rabbit => "rabbit",
            Animal::Tiger => "tiger",
            Animal::Turtle => "turtle",
            Animal::Deer => "deer",
        }
    }

    /// Short description shown next to a main result.
    pub fn message(self) -> &'static str {
        match self {
            Animal::Wolf => "Wolf face! A strong, free-spirited style.",
            Animal::Turtle => "Turtle face! Calm, easygoing charm.",
            Animal::Tiger => "Tiger face! Bold and full of confidence.",
            Animal::Squirrel => "Squirrel face! Lively, cute energy.",
            Animal::Dinosaur => "Dinosaur face! Powerful presence.",
            Animal::Deer => "Deer face! Graceful and delicate.",
            Animal::Rabbit => "Rabbit face! Cute and lovable.",
            Animal::Snake => "Snake face! Mysterious and alluring.",
            Animal::Bear => "Bear face! Dependable and trustworthy.",
            Animal::Cat => "Cat face! Soft and refined charm.",
            Animal::Dog => "Dog face! Loyal and friendly.",
        }
    }

    /// Labels excluded when this gender hint is supplied.
    pub fn excluded_by(self, hint: GenderHint) -> bool {
        match hint {
            GenderHint::Male => FEMALE_PREFERENCE.contains(&self),
            GenderHint::Female => MALE_PREFERENCE.contains(&self),
            GenderHint::None => false,
        }
    }

    /// Whether `self` and `other` may not appear together in one result.
    pub fn conflicts_with(self, other: Animal) -> bool {
        FORBIDDEN_PAIRS
            .iter()
            .any(|&(a, b)| (a == self && b == other) || (a == other && b == self))
    }
}

impl fmt::Display for Animal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown animal label: {0:?}")]
pub struct UnknownLabel(pub String);

impl FromStr for Animal {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Animal::ALL
            .iter()
            .copied()
            .find(|a| a.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// Optional gender hint supplied with an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenderHint {
    Male,
    Female,
    #[default]
    None,
}

impl GenderHint {
    /// Lenient parse: anything other than `male`/`female` means no hint.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" => GenderHint::Male,
            "female" => GenderHint::Female,
            _ => GenderHint::None,
        }
    }
}

impl From<Option<&str>> for GenderHint {
    fn from(s: Option<&str>) -> Self {
        s.map(GenderHint::parse).unwrap_or_default()
    }
}

pub const MALE_PREFERENCE: [Animal; 3] = [Animal::Bear, Animal::Tiger, Animal::Wolf];
pub const FEMALE_PREFERENCE: [Animal; 3] = [Animal::Rabbit, Animal::Cat, Animal::Deer];

/// Unordered pairs that never co-occur in a result.
pub const FORBIDDEN_PAIRS: [(Animal, Animal); 5] = [
    (Animal::Cat, Animal::Bear),
    (Animal::Cat, Animal::Dinosaur),
    (Animal::Snake, Animal::Bear),
    (Animal::Rabbit, Animal::Bear),
    (Animal::Turtle, Animal::Cat),
];

#[derive(Error, Debug)]
pub enum LabelsFileError {
    #[error("failed to read labels file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {source}")]
    Label {
        line: usize,
        #[source]
        source: UnknownLabel,
    },
    #[error("labels file has {0} labels, model emits 11")]
    Count(usize),
}

/// Parse a Teachable Machine `labels.txt` (`"0 bear"` per line).
///
/// Lines without an index prefix are skipped, matching the exporter output
/// which never produces them.
pub fn parse_labels(text: &str) -> Result<Vec<Animal>, LabelsFileError> {
    let mut labels = Vec::with_capacity(LABEL_COUNT);
    for (i, line) in text.lines().enumerate() {
        let Some((_, name)) = line.trim().split_once(' ') else {
            continue;
        };
        let label = name
            .parse::<Animal>()
            .map_err(|source| LabelsFileError::Label { line: i + 1, source })?;
        labels.push(label);
    }
    if labels.len() != LABEL_COUNT {
        return Err(LabelsFileError::Count(labels.len()));
    }
    Ok(labels)
}

pub fn load_labels(path: &Path) -> Result<Vec<Animal>, LabelsFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| LabelsFileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_labels(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("Bear".parse::<Animal>(), Ok(Animal::Bear));
        assert_eq!(" deer ".parse::<Animal>(), Ok(Animal::Deer));
        assert!("unicorn".parse::<Animal>().is_err());
    }

    #[test]
    fn test_gender_hint_parse() {
        assert_eq!(GenderHint::parse("male"), GenderHint::Male);
        assert_eq!(GenderHint::parse("FEMALE"), GenderHint::Female);
        assert_eq!(GenderHint::parse(""), GenderHint::None);
        assert_eq!(GenderHint::parse("other"), GenderHint::None);
        assert_eq!(GenderHint::from(None), GenderHint::None);
    }

    #[test]
    fn test_preference_sets_disjoint() {
        for m in MALE_PREFERENCE {
            assert!(!FEMALE_PREFERENCE.contains(&m));
        }
    }

    #[test]
    fn test_conflicts_symmetric() {
        for (a, b) in FORBIDDEN_PAIRS {
            assert!(a.conflicts_with(b));
            assert!(b.conflicts_with(a));
        }
        assert!(!Animal::Dog.conflicts_with(Animal::Bear));
    }

    #[test]
    fn test_excluded_by() {
        assert!(Animal::Cat.excluded_by(GenderHint::Male));
        assert!(!Animal::Cat.excluded_by(GenderHint::Female));
        assert!(Animal::Wolf.excluded_by(GenderHint::Female));
        assert!(!Animal::Wolf.excluded_by(GenderHint::None));
    }

    #[test]
    fn test_parse_labels_file() {
        let text = Animal::ALL
            .iter()
            .enumerate()
            .map(|(i, a)| format!("{i} {a}"))
            .collect::<Vec<_>>()
            .join("\n");
        let labels = parse_labels(&text).unwrap();
        assert_eq!(labels, Animal::ALL.to_vec());
    }

    #[test]
    fn test_parse_labels_wrong_count() {
        let err = parse_labels("0 bear\n1 cat\n").unwrap_err();
        assert!(matches!(err, LabelsFileError::Count(2)));
    }

    #[test]
    fn test_parse_labels_unknown() {
        let err = parse_labels("0 bear\n1 unicorn\n").unwrap_err();
        assert!(matches!(err, LabelsFileError::Label { line: 2, .. }));
    }
}
