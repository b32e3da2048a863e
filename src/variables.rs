//! Static topic and heatmap-variable tables, and the per-block
//! classification used by the thematic layer.

use crate::aggregate::{DWELLINGS, EMPLOYED, HOUSEHOLDS, POPULATION, UNEMPLOYED};
use crate::types::Feature;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Topic {
    pub id: &'static str,
    pub label: &'static str,
    pub icon: &'static str,
}

/// Sidebar topics, in display order.
pub static TOPICS: [Topic; 6] = [
    Topic {
        id: "population",
        label: "Población y Género",
        icon: "people",
    },
    Topic {
        id: "age-pyramid",
        label: "Grupos de Edad",
        icon: "chart",
    },
    Topic {
        id: "employment",
        label: "Empleo",
        icon: "briefcase",
    },
    Topic {
        id: "literacy",
        label: "Alfabetización",
        icon: "books",
    },
    Topic {
        id: "housing",
        label: "Vivienda",
        icon: "house",
    },
    Topic {
        id: "households",
        label: "Hogares",
        icon: "family",
    },
];

pub const TRANSPORT_MODES: &[&str] = &[
    "n_transporte_bicicleta",
    "n_transporte_publico",
    "n_transporte_camina",
    "n_transporte_auto",
    "n_transporte_motocicleta",
];

pub const AGE_FIELDS: &[&str] = &[
    "n_edad_0_5",
    "n_edad_6_13",
    "n_edad_14_17",
    "n_edad_18_24",
    "n_edad_25_44",
    "n_edad_45_59",
    "n_edad_60_mas",
];

/// Highlight rule for variables that are not judged against sibling fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdRule {
    /// The field is more than `min_share` of the sum of `of`.
    ShareOf {
        of: &'static [&'static str],
        min_share: f64,
    },
    /// The field's share of `of` is above the pooled share across the
    /// whole collection (`sum(field) / sum(of)`).
    AboveAverageShare { of: &'static [&'static str] },
}

/// How a variable's value and highlight are obtained for one block.
#[derive(Debug, Clone, Copy)]
pub enum VariableRule {
    /// Highlighted wherever the field is positive.
    Direct,
    /// Highlighted where the field is the dominant one among these.
    Compare(&'static [&'static str]),
    Threshold(ThresholdRule),
    /// Value computed from other properties; highlighted when positive.
    Calculated(fn(&Feature) -> f64),
}

#[derive(Debug, Clone, Copy)]
pub struct HeatmapVariable {
    pub id: &'static str,
    pub label: &'static str,
    pub category: &'static str,
    /// Stored column; `None` for calculated variables.
    pub field: Option<&'static str>,
    pub description: &'static str,
    pub rule: VariableRule,
}

pub static HEATMAP_VARIABLES: [HeatmapVariable; 13] = [
    HeatmapVariable {
        id: "transporte_bicicleta",
        label: "Uso de Bicicleta",
        category: "Transporte",
        field: Some("n_transporte_bicicleta"),
        description: "Manzanas donde la bicicleta es el modo de transporte dominante",
        rule: VariableRule::Compare(TRANSPORT_MODES),
    },
    HeatmapVariable {
        id: "transporte_publico",
        label: "Transporte Público",
        category: "Transporte",
        field: Some("n_transporte_publico"),
        description: "Manzanas donde el transporte público es dominante",
        rule: VariableRule::Compare(TRANSPORT_MODES),
    },
    HeatmapVariable {
        id: "transporte_camina",
        label: "Caminata",
        category: "Transporte",
        field: Some("n_transporte_camina"),
        description: "Manzanas donde caminar es el modo dominante",
        rule: VariableRule::Compare(TRANSPORT_MODES),
    },
    HeatmapVariable {
        id: "transporte_auto",
        label: "Automóvil Particular",
        category: "Transporte",
        field: Some("n_transporte_auto"),
        description: "Manzanas donde el auto es el modo dominante",
        rule: VariableRule::Compare(TRANSPORT_MODES),
    },
    HeatmapVariable {
        id: "jefatura_mujer",
        label: "Jefatura Femenina",
        category: "Hogares",
        field: Some("n_jefatura_mujer"),
        description: "Manzanas donde predominan hogares con jefatura femenina",
        rule: VariableRule::Threshold(ThresholdRule::ShareOf {
            of: &[HOUSEHOLDS],
            min_share: 0.5,
        }),
    },
    HeatmapVariable {
        id: "pueblos_originarios",
        label: "Pueblos Originarios",
        category: "Identidad",
        field: Some("n_pueblos_orig"),
        description: "Manzanas con alta presencia de pueblos originarios",
        rule: VariableRule::Threshold(ThresholdRule::AboveAverageShare { of: &[POPULATION] }),
    },
    HeatmapVariable {
        id: "inmigrantes",
        label: "Población Inmigrante",
        category: "Identidad",
        field: Some("n_inmigrantes"),
        description: "Manzanas con alta presencia de población inmigrante",
        rule: VariableRule::Threshold(ThresholdRule::AboveAverageShare { of: &[POPULATION] }),
    },
    HeatmapVariable {
        id: "adultos_mayores",
        label: "Adultos Mayores",
        category: "Demografía",
        field: Some("n_edad_60_mas"),
        description: "Manzanas donde adultos mayores son el grupo etario dominante",
        rule: VariableRule::Compare(AGE_FIELDS),
    },
    HeatmapVariable {
        id: "jovenes",
        label: "Población Joven",
        category: "Demografía",
        field: Some("n_edad_18_24"),
        description: "Manzanas donde jóvenes son el grupo etario dominante",
        rule: VariableRule::Compare(AGE_FIELDS),
    },
    HeatmapVariable {
        id: "ninos",
        label: "Población Infantil",
        category: "Demografía",
        field: Some("n_edad_0_5"),
        description: "Manzanas donde niños 0-5 años son el grupo dominante",
        rule: VariableRule::Compare(AGE_FIELDS),
    },
    HeatmapVariable {
        id: "hacinamiento",
        label: "Hacinamiento",
        category: "Vivienda",
        field: Some("n_viv_hacinadas"),
        description: "Manzanas con alta proporción de viviendas hacinadas",
        rule: VariableRule::Threshold(ThresholdRule::ShareOf {
            of: &[DWELLINGS],
            min_share: 0.3,
        }),
    },
    HeatmapVariable {
        id: "sin_internet",
        label: "Sin Conectividad",
        category: "Conectividad",
        field: None,
        description: "Manzanas donde predominan hogares sin internet",
        rule: VariableRule::Calculated(households_without_internet),
    },
    HeatmapVariable {
        id: "desocupacion",
        label: "Desocupación Alta",
        category: "Empleo",
        field: Some("n_desocupado"),
        description: "Manzanas con tasa de desocupación superior al promedio",
        rule: VariableRule::Threshold(ThresholdRule::ShareOf {
            of: &[EMPLOYED, UNEMPLOYED],
            min_share: 0.15,
        }),
    },
];

pub fn find_variable(id: &str) -> Option<&'static HeatmapVariable> {
    HEATMAP_VARIABLES.iter().find(|v| v.id == id)
}

/// Households without internet, reported only where they outnumber the
/// connected ones.
pub fn households_without_internet(feature: &Feature) -> f64 {
    let total = feature.number(HOUSEHOLDS);
    let with_internet = feature.number("n_internet");
    let without_internet = total - with_internet;
    if without_internet > with_internet {
        without_internet
    } else {
        0.0
    }
}

/// The field with the strictly greatest value; on a tie the earliest wins.
pub fn dominant_field<'a>(feature: &Feature, fields: &[&'a str]) -> Option<&'a str> {
    let mut best: Option<(&'a str, f64)> = None;
    for &field in fields {
        let value = feature.number(field);
        match best {
            Some((_, top)) if value <= top => {}
            _ => best = Some((field, value)),
        }
    }
    best.map(|(field, _)| field)
}

fn sum_of(feature: &Feature, fields: &[&str]) -> f64 {
    fields.iter().map(|f| feature.number(f)).sum()
}

impl HeatmapVariable {
    /// The variable's raw value for one block.
    pub fn value(&self, feature: &Feature) -> f64 {
        match (self.rule, self.field) {
            (VariableRule::Calculated(compute), _) => compute(feature),
            (_, Some(field)) => feature.number(field),
            (_, None) => 0.0,
        }
    }

    /// Collection-wide baseline needed by [`ThresholdRule::AboveAverageShare`].
    pub fn baseline(&self, features: &[Feature]) -> Option<f64> {
        match (self.rule, self.field) {
            (VariableRule::Threshold(ThresholdRule::AboveAverageShare { of }), Some(field)) => {
                let part: f64 = features.iter().map(|f| f.number(field)).sum();
                let whole: f64 = features.iter().map(|f| sum_of(f, of)).sum();
                Some(if whole > 0.0 { part / whole } else { 0.0 })
            }
            _ => None,
        }
    }

    pub fn is_highlighted(&self, feature: &Feature, baseline: Option<f64>) -> bool {
        let value = self.value(feature);
        if value <= 0.0 {
            return false;
        }
        match self.rule {
            VariableRule::Direct | VariableRule::Calculated(_) => true,
            VariableRule::Compare(fields) => {
                self.field.is_some() && dominant_field(feature, fields) == self.field
            }
            VariableRule::Threshold(ThresholdRule::ShareOf { of, min_share }) => {
                let whole = sum_of(feature, of);
                whole > 0.0 && value / whole > min_share
            }
            VariableRule::Threshold(ThresholdRule::AboveAverageShare { of }) => {
                let whole = sum_of(feature, of);
                whole > 0.0 && value / whole > baseline.unwrap_or(0.0)
            }
        }
    }

    pub fn descriptor(&self) -> VariableDescriptor {
        let (kind, compare_fields, threshold) = match self.rule {
            VariableRule::Direct => ("direct", None, None),
            VariableRule::Compare(fields) => ("compare", Some(fields.to_vec()), None),
            VariableRule::Threshold(rule) => ("threshold", None, Some(rule.describe())),
            VariableRule::Calculated(_) => ("calculated", None, None),
        };
        VariableDescriptor {
            id: self.id,
            label: self.label,
            category: self.category,
            field: self.field,
            description: self.description,
            kind,
            compare_fields,
            threshold,
        }
    }
}

impl ThresholdRule {
    fn describe(&self) -> String {
        match self {
            ThresholdRule::ShareOf { of, min_share } => {
                format!("> {:.0}% of {}", min_share * 100.0, of.join(" + "))
            }
            ThresholdRule::AboveAverageShare { of } => {
                format!("share of {} above collection average", of.join(" + "))
            }
        }
    }
}

/// Serializable view of a [`HeatmapVariable`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub category: &'static str,
    pub field: Option<&'static str>,
    pub description: &'static str,
    pub kind: &'static str,
    pub compare_fields: Option<Vec<&'static str>>,
    pub threshold: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub index: usize,
    pub value: f64,
    pub highlighted: bool,
    /// `value` when highlighted, zero otherwise.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heatmap {
    pub variable: &'static str,
    pub highlighted: usize,
    pub cells: Vec<HeatmapCell>,
}

/// Classifies every block of `features` for `variable`, in collection order.
pub fn heatmap(variable: &HeatmapVariable, features: &[Feature]) -> Heatmap {
    let baseline = variable.baseline(features);
    let cells: Vec<HeatmapCell> = features
        .iter()
        .enumerate()
        .map(|(index, feature)| {
            let value = variable.value(feature);
            let highlighted = variable.is_highlighted(feature, baseline);
            HeatmapCell {
                index,
                value,
                highlighted,
                weight: if highlighted { value } else { 0.0 },
            }
        })
        .collect();
    Heatmap {
        variable: variable.id,
        highlighted: cells.iter().filter(|c| c.highlighted).count(),
        cells,
    }
}
