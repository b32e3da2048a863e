//! Demographic summaries over a selection of manzanas.
//!
//! Every function here is a pure reduction over `&[Feature]`: missing or
//! malformed fields count as zero and nothing can fail. Percentages are
//! rounded to one decimal and are `0.0` whenever their total is zero.

use crate::types::Feature;
use serde::Serialize;

pub const POPULATION: &str = "n_per";
pub const MALE: &str = "n_hombres";
pub const FEMALE: &str = "n_mujeres";
pub const EMPLOYED: &str = "n_ocupado";
pub const UNEMPLOYED: &str = "n_desocupado";
pub const INACTIVE: &str = "n_fuera_fuerza_trabajo";
pub const ILLITERATE: &str = "n_analfabet";
pub const AVERAGE_AGE: &str = "prom_edad";
pub const DWELLINGS: &str = "n_vp";
pub const DWELLINGS_OCCUPIED: &str = "n_vp_ocupada";
pub const DWELLINGS_VACANT: &str = "n_vp_desocupada";
pub const HOUSEHOLDS: &str = "n_hog";

/// INE age brackets, youngest first: (field, label).
pub const AGE_BRACKETS: [(&str, &str); 7] = [
    ("n_edad_0_5", "0-5"),
    ("n_edad_6_13", "6-13"),
    ("n_edad_14_17", "14-17"),
    ("n_edad_18_24", "18-24"),
    ("n_edad_25_44", "25-44"),
    ("n_edad_45_59", "45-59"),
    ("n_edad_60_mas", "60+"),
];

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `100 * part / total`, rounded to one decimal; zero when `total` is zero.
pub fn percent(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round1(100.0 * part as f64 / total as f64)
}

pub fn sum_field(features: &[Feature], field: &str) -> i64 {
    features.iter().map(|f| f.count(field)).sum()
}

pub fn total_population(features: &[Feature]) -> i64 {
    sum_field(features, POPULATION)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenderBreakdown {
    pub male: i64,
    pub female: i64,
    pub total: i64,
    pub male_percent: f64,
    pub female_percent: f64,
}

pub fn gender_breakdown(features: &[Feature]) -> GenderBreakdown {
    let male = sum_field(features, MALE);
    let female = sum_field(features, FEMALE);
    let total = male + female;
    GenderBreakdown {
        male,
        female,
        total,
        male_percent: percent(male, total),
        female_percent: percent(female, total),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgeGroup {
    pub label: &'static str,
    pub count: i64,
}

/// One entry per bracket, always in [`AGE_BRACKETS`] order.
pub fn age_groups_data(features: &[Feature]) -> Vec<AgeGroup> {
    AGE_BRACKETS
        .iter()
        .map(|&(field, label)| AgeGroup {
            label,
            count: sum_field(features, field),
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmploymentData {
    pub employed: i64,
    pub unemployed: i64,
    pub inactive: i64,
    pub total: i64,
    pub employed_percent: f64,
    pub unemployed_percent: f64,
    pub inactive_percent: f64,
}

pub fn employment_data(features: &[Feature]) -> EmploymentData {
    let employed = sum_field(features, EMPLOYED);
    let unemployed = sum_field(features, UNEMPLOYED);
    let inactive = sum_field(features, INACTIVE);
    let total = employed + unemployed + inactive;
    EmploymentData {
        employed,
        unemployed,
        inactive,
        total,
        employed_percent: percent(employed, total),
        unemployed_percent: percent(unemployed, total),
        inactive_percent: percent(inactive, total),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiteracyData {
    pub literate: i64,
    pub illiterate: i64,
    pub total: i64,
    pub literate_percent: f64,
    pub illiterate_percent: f64,
}

/// The census only counts illiterate people; literate is the remainder of
/// the total population.
pub fn literacy_data(features: &[Feature]) -> LiteracyData {
    let illiterate = sum_field(features, ILLITERATE);
    let total = total_population(features);
    let literate = total - illiterate;
    LiteracyData {
        literate,
        illiterate,
        total,
        literate_percent: percent(literate, total),
        illiterate_percent: percent(illiterate, total),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HousingData {
    pub casa: i64,
    pub depto: i64,
    pub mediagua: i64,
    pub otro: i64,
    pub total_viv: i64,
    pub ocupadas: i64,
    pub desocupadas: i64,
}

pub fn housing_data(features: &[Feature]) -> HousingData {
    HousingData {
        casa: sum_field(features, "n_tipo_viv_casa"),
        depto: sum_field(features, "n_tipo_viv_depto"),
        mediagua: sum_field(features, "n_tipo_viv_mediagua"),
        otro: sum_field(features, "n_tipo_viv_otro"),
        total_viv: sum_field(features, DWELLINGS),
        ocupadas: sum_field(features, DWELLINGS_OCCUPIED),
        desocupadas: sum_field(features, DWELLINGS_VACANT),
    }
}

/// Mean of `prom_edad` over blocks that report it. A zero or negative
/// average means "no data" and is left out of both sides of the mean.
pub fn avg_age(features: &[Feature]) -> f64 {
    let ages: Vec<f64> = features
        .iter()
        .map(|f| f.number(AVERAGE_AGE))
        .filter(|age| *age > 0.0)
        .collect();
    if ages.is_empty() {
        return 0.0;
    }
    round1(ages.iter().sum::<f64>() / ages.len() as f64)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdData {
    pub total: i64,
    pub unipersonal: i64,
    pub con_menores: i64,
    pub adulto_mayor: i64,
    pub jefatura_mujer: i64,
}

pub fn household_data(features: &[Feature]) -> HouseholdData {
    HouseholdData {
        total: sum_field(features, HOUSEHOLDS),
        unipersonal: sum_field(features, "n_hog_unipersonales"),
        con_menores: sum_field(features, "n_hog_menores"),
        adulto_mayor: sum_field(features, "n_hog_60"),
        jefatura_mujer: sum_field(features, "n_jefatura_mujer"),
    }
}

/// The full statistics catalogue for one selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub manzanas: usize,
    pub total_population: i64,
    pub gender: GenderBreakdown,
    pub age_groups: Vec<AgeGroup>,
    pub employment: EmploymentData,
    pub literacy: LiteracyData,
    pub housing: HousingData,
    pub avg_age: f64,
    pub households: HouseholdData,
}

impl Summary {
    pub fn compute(features: &[Feature]) -> Self {
        Self {
            manzanas: features.len(),
            total_population: total_population(features),
            gender: gender_breakdown(features),
            age_groups: age_groups_data(features),
            employment: employment_data(features),
            literacy: literacy_data(features),
            housing: housing_data(features),
            avg_age: avg_age(features),
            households: household_data(features),
        }
    }
}
