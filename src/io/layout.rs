//! Templated file naming for per-record artifacts.
//!
//! Templates are plain strings with `{field}` placeholders. The `id` field
//! accepts a zero-padding width (`{id:04}`). Available fields:
//!
//! - record fields: `cohort`, `id`, `paradigm`, `date`
//! - stage qualifiers: `space`, `diffeomorphism`, `scale_type`
//!
//! Stage qualifiers are only known for later pipeline stages; a template that
//! needs one that was not supplied is a configuration error, reported by
//! `FileLayout::check` before any job runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Identifier;

/// Artifact kinds a record owns on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    Session,
    ReferenceMaps,
    Design,
    PopulationMap,
    Result,
}

impl ArtifactRole {
    pub const ALL: [ArtifactRole; 5] = [
        ArtifactRole::Session,
        ArtifactRole::ReferenceMaps,
        ArtifactRole::Design,
        ArtifactRole::PopulationMap,
        ArtifactRole::Result,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            ArtifactRole::Session => "Session",
            ArtifactRole::ReferenceMaps => "ReferenceMaps",
            ArtifactRole::Design => "Design",
            ArtifactRole::PopulationMap => "PopulationMap",
            ArtifactRole::Result => "Result",
        }
    }
}

impl fmt::Display for ArtifactRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Qualifiers of later pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageQualifiers {
    /// Population space name.
    pub space: Option<String>,
    /// Diffeomorphism family name.
    pub diffeomorphism: Option<String>,
    pub scale_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("no file template for {0}")]
    MissingTemplate(ArtifactRole),

    #[error("template for {role} needs '{field}', which was not supplied")]
    UnresolvedField { role: ArtifactRole, field: String },

    #[error("template for {role} uses unknown field '{field}'")]
    UnknownField { role: ArtifactRole, field: String },

    #[error("malformed template for {role}: {template}")]
    Malformed { role: ArtifactRole, template: String },

    #[error("invalid date format '{0}'")]
    BadDateFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    pub templates: BTreeMap<ArtifactRole, String>,
    /// chrono format string for the `date` field.
    pub strftime: String,
}

impl Default for FileLayout {
    fn default() -> Self {
        let templates = [
            (
                ArtifactRole::Session,
                "ses/{paradigm}/{cohort}-{id:04}-{paradigm}-{date}.ses",
            ),
            (
                ArtifactRole::ReferenceMaps,
                "ref/{paradigm}/{cohort}-{id:04}-{paradigm}-{date}.ref",
            ),
            (
                ArtifactRole::Design,
                "irr/{paradigm}/{cohort}-{id:04}-{paradigm}-{date}.irr",
            ),
            (
                ArtifactRole::PopulationMap,
                "pop/{paradigm}/{space}/{diffeomorphism}/{cohort}-{id:04}-{paradigm}-{date}-{space}.pop",
            ),
            (
                ArtifactRole::Result,
                "fit/{paradigm}/{space}/{diffeomorphism}/{scale_type}/{cohort}-{id:04}-{paradigm}-{date}-{space}.fit",
            ),
        ];
        Self {
            templates: templates
                .into_iter()
                .map(|(role, t)| (role, t.to_string()))
                .collect(),
            strftime: "%Y-%m-%d-%H%M".to_string(),
        }
    }
}

/// One `{...}` segment of a template.
enum Segment<'a> {
    Literal(&'a str),
    Field { name: &'a str, width: Option<usize> },
}

fn parse(role: ArtifactRole, template: &str) -> Result<Vec<Segment<'_>>, LayoutError> {
    let malformed = || LayoutError::Malformed {
        role,
        template: template.to_string(),
    };
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            out.push(Segment::Literal(&rest[..open]));
        }
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(malformed)?;
        let inner = &after[..close];
        if inner.contains('{') {
            return Err(malformed());
        }
        let (name, width) = match inner.split_once(':') {
            Some((name, digits)) => (name, Some(digits.parse::<usize>().map_err(|_| malformed())?)),
            None => (inner, None),
        };
        out.push(Segment::Field { name, width });
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(malformed());
    }
    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    Ok(out)
}

impl FileLayout {
    /// Layout with the short date format (`%Y-%m-%d`).
    pub fn short_dates() -> Self {
        Self {
            strftime: "%Y-%m-%d".to_string(),
            ..Self::default()
        }
    }

    /// Ensure `role` resolves with `qualifiers` for every record.
    pub fn check(&self, role: ArtifactRole, qualifiers: &StageQualifiers) -> Result<(), LayoutError> {
        let template = self
            .templates
            .get(&role)
            .ok_or(LayoutError::MissingTemplate(role))?;
        self.check_date_format()?;
        for segment in parse(role, template)? {
            if let Segment::Field { name, .. } = segment {
                field_value(role, name, None, qualifiers)?;
            }
        }
        Ok(())
    }

    fn check_date_format(&self) -> Result<(), LayoutError> {
        if StrftimeItems::new(&self.strftime).any(|item| matches!(item, Item::Error)) {
            return Err(LayoutError::BadDateFormat(self.strftime.clone()));
        }
        Ok(())
    }

    /// Concrete path of `role` for `name`, relative to `root`.
    pub fn resolve(
        &self,
        root: &Path,
        role: ArtifactRole,
        name: &Identifier,
        qualifiers: &StageQualifiers,
    ) -> Result<PathBuf, LayoutError> {
        let template = self
            .templates
            .get(&role)
            .ok_or(LayoutError::MissingTemplate(role))?;
        self.check_date_format()?;
        let date = name.datetime.format(&self.strftime).to_string();

        let mut out = String::with_capacity(template.len() + 32);
        for segment in parse(role, template)? {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field { name: field, width } => {
                    let value = field_value(role, field, Some((name, &date)), qualifiers)?;
                    match width {
                        Some(w) => out.push_str(&format!("{value:0>w$}")),
                        None => out.push_str(&value),
                    }
                }
            }
        }
        Ok(root.join(out))
    }
}

fn field_value(
    role: ArtifactRole,
    field: &str,
    record: Option<(&Identifier, &str)>,
    qualifiers: &StageQualifiers,
) -> Result<String, LayoutError> {
    let unresolved = || LayoutError::UnresolvedField {
        role,
        field: field.to_string(),
    };
    let qualifier = |q: &Option<String>| q.clone().ok_or_else(unresolved);
    match field {
        "cohort" | "id" | "paradigm" | "date" => Ok(match record {
            None => String::new(),
            Some((name, date)) => match field {
                "cohort" => name.cohort.clone(),
                "id" => name.id.to_string(),
                "paradigm" => name.paradigm.clone(),
                _ => date.to_string(),
            },
        }),
        "space" => qualifier(&qualifiers.space),
        "diffeomorphism" => qualifier(&qualifiers.diffeomorphism),
        "scale_type" => qualifier(&qualifiers.scale_type),
        _ => Err(LayoutError::UnknownField {
            role,
            field: field.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn name() -> Identifier {
        let dt = NaiveDate::from_ymd_opt(2016, 11, 30)
            .unwrap()
            .and_hms_opt(14, 5, 0)
            .unwrap();
        Identifier::new("pat", 12, dt, "motor")
    }

    fn qualifiers() -> StageQualifiers {
        StageQualifiers {
            space: Some("mni".into()),
            diffeomorphism: Some("affine".into()),
            scale_type: Some("max".into()),
        }
    }

    #[test]
    fn resolves_default_templates() {
        let layout = FileLayout::default();
        let root = Path::new("/data");

        let ses = layout
            .resolve(root, ArtifactRole::Session, &name(), &StageQualifiers::default())
            .unwrap();
        assert_eq!(ses, PathBuf::from("/data/ses/motor/pat-0012-motor-2016-11-30-1405.ses"));

        let fit = layout
            .resolve(root, ArtifactRole::Result, &name(), &qualifiers())
            .unwrap();
        assert_eq!(
            fit,
            PathBuf::from("/data/fit/motor/mni/affine/max/pat-0012-motor-2016-11-30-1405-mni.fit")
        );

        let short = FileLayout::short_dates()
            .resolve(root, ArtifactRole::Design, &name(), &StageQualifiers::default())
            .unwrap();
        assert_eq!(short, PathBuf::from("/data/irr/motor/pat-0012-motor-2016-11-30.irr"));
    }

    #[test]
    fn missing_qualifier_is_reported_by_check() {
        let layout = FileLayout::default();
        let partial = StageQualifiers {
            space: Some("mni".into()),
            ..StageQualifiers::default()
        };
        assert!(layout.check(ArtifactRole::Session, &partial).is_ok());
        assert_eq!(
            layout.check(ArtifactRole::Result, &partial),
            Err(LayoutError::UnresolvedField {
                role: ArtifactRole::Result,
                field: "diffeomorphism".into()
            })
        );
    }

    #[test]
    fn malformed_and_unknown_fields() {
        let mut layout = FileLayout::default();
        layout
            .templates
            .insert(ArtifactRole::Design, "irr/{cohort".to_string());
        assert!(matches!(
            layout.check(ArtifactRole::Design, &qualifiers()),
            Err(LayoutError::Malformed { .. })
        ));

        layout
            .templates
            .insert(ArtifactRole::Design, "irr/{subject}.irr".to_string());
        assert!(matches!(
            layout.check(ArtifactRole::Design, &qualifiers()),
            Err(LayoutError::UnknownField { .. })
        ));

        layout.templates.remove(&ArtifactRole::Design);
        assert_eq!(
            layout.check(ArtifactRole::Design, &qualifiers()),
            Err(LayoutError::MissingTemplate(ArtifactRole::Design))
        );
    }

    #[test]
    fn bad_date_format_is_a_layout_error() {
        let layout = FileLayout {
            strftime: "%Y-%Q".to_string(),
            ..FileLayout::default()
        };
        assert_eq!(
            layout.check(ArtifactRole::Session, &qualifiers()),
            Err(LayoutError::BadDateFormat("%Y-%Q".into()))
        );
        assert!(layout
            .resolve(Path::new("/data"), ArtifactRole::Session, &name(), &qualifiers())
            .is_err());
    }
}
