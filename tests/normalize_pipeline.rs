use anyhow::Result;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

use country_metrics::config::Settings;
use country_metrics::domain::Frequency;
use country_metrics::error::PipelineError;
use country_metrics::pipeline::artifact;
use country_metrics::pipeline::collector::CountryCollector;
use country_metrics::pipeline::processing::normalize::{OutlierClip, Scale};
use country_metrics::pipeline::processing::quality_gate::MetricDomain;
use country_metrics::pipeline::run::{normalize, RunStage};
use country_metrics::pipeline::sources::{SourceManifest, SourceSpec};

const CPI: &str = "\
REF_AREA_ID,REF_AREA_NAME,FREQ,2014-12,2020-01,2020-02,2020-03,2020-04,2020-05,2020-06,2020-07,2021-01
FR,France,M,99,100,101,102,103,104,105,,
FR,France,Q,1,1,1,1,1,1,1,1,1
";

const WEF: &str = "\
REF_AREA,REF_AREA_LABEL,INDICATOR,2019
AAA,Aland,pillar,7
BBB,Beeland,pillar,1
FR,France,pillar,4
CCC,Ceeland,pillar,7.4
";

const GDP: &str = "\
REF_AREA,REF_AREA_LABEL,2014,2018,2019
XX,Exland,3.3,2.5,n/a
YY,Whyland,,,
FR,French Republic,0.9,1.8,1.9
";

const FOREST: &str = "\
REF_AREA,REF_AREA_LABEL,2019
FR,France,31.2
ZZ,Zedland,140
";

fn manifest() -> SourceManifest {
    SourceManifest::new(vec![
        SourceSpec::annual("cpi", "cpi.csv", "consumer_price_index")
            .with_frequency(Frequency::Monthly)
            .with_filter("FREQ", "M")
            .with_domain(MetricDomain::NonNegative),
        SourceSpec::annual("wef_education", "wef.csv", "higher_education_score")
            .with_scale(Scale::Linear { min: 1.0, max: 7.0 })
            .with_clip(OutlierClip::Absolute { lower: 1.0, upper: 7.0 })
            .with_domain(MetricDomain::Percentage),
        SourceSpec::annual("gdp", "gdp.csv", "real_gdp_growth_rate"),
        SourceSpec::annual("forest", "forest.csv", "forest_area_percent").with_domain(MetricDomain::Percentage),
    ])
}

fn write_raw(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("cpi.csv"), CPI).unwrap();
    fs::write(dir.join("wef.csv"), WEF).unwrap();
    fs::write(dir.join("gdp.csv"), GDP).unwrap();
    fs::write(dir.join("forest.csv"), FOREST).unwrap();
}

fn settings(root: &Path) -> Settings {
    Settings {
        raw_dir: root.join("raw"),
        output_path: root.join("processed").join("country_metrics.csv"),
        ..Settings::default()
    }
}

#[test]
fn test_normalize_end_to_end() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    write_raw(&settings.raw_dir);

    let report = normalize(&settings, &manifest(), &CountryCollector::new(&settings.raw_dir))?;
    assert_eq!(report.rows_written, 7);
    assert_eq!(report.exclusions.excluded_rows, 1);
    assert_eq!(report.exclusions.sample[0].entity_code, "ZZ");
    assert_eq!(report.unparseable_cells(), 1);

    let table = artifact::read(&settings.output_path)?;
    assert_eq!(
        table.metrics,
        vec![
            "consumer_price_index",
            "higher_education_score",
            "real_gdp_growth_rate",
            "forest_area_percent"
        ]
    );
    // name comes from the first source in manifest order
    assert_eq!(table.row("FR", 2019).unwrap().entity_name, "France");
    Ok(())
}

#[test]
fn test_monthly_partial_year_is_mean_of_present_months() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    write_raw(&settings.raw_dir);

    normalize(&settings, &manifest(), &CountryCollector::new(&settings.raw_dir))?;
    let table = artifact::read(&settings.output_path)?;

    assert_eq!(table.value("FR", 2020, "consumer_price_index"), Some(102.5));
    assert!(table.row("FR", 2021).is_none());
    assert!(table.row("FR", 2014).is_none());
    Ok(())
}

#[test]
fn test_pillar_scores_rescale_to_percentages() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    write_raw(&settings.raw_dir);

    normalize(&settings, &manifest(), &CountryCollector::new(&settings.raw_dir))?;
    let table = artifact::read(&settings.output_path)?;

    assert_eq!(table.value("AAA", 2019, "higher_education_score"), Some(100.0));
    assert_eq!(table.value("BBB", 2019, "higher_education_score"), Some(0.0));
    assert_eq!(table.value("FR", 2019, "higher_education_score"), Some(50.0));
    assert_eq!(table.value("CCC", 2019, "higher_education_score"), Some(100.0));
    for row in &table.rows {
        if let Some(v) = row.values[1] {
            assert!((0.0..=100.0).contains(&v));
        }
    }
    Ok(())
}

#[test]
fn test_single_metric_row_kept_and_empty_row_dropped() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    write_raw(&settings.raw_dir);

    normalize(&settings, &manifest(), &CountryCollector::new(&settings.raw_dir))?;
    let table = artifact::read(&settings.output_path)?;

    let xx = table.row("XX", 2018).unwrap();
    assert_eq!(xx.values, vec![None, None, Some(2.5), None]);
    assert!(table.row("YY", 2019).is_none());
    assert!(table.rows.iter().all(|r| r.values.iter().any(Option::is_some)));
    assert!(table.rows.iter().all(|r| r.year >= 2015));
    Ok(())
}

#[test]
fn test_absent_raw_values_stay_absent() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    write_raw(&settings.raw_dir);

    normalize(&settings, &manifest(), &CountryCollector::new(&settings.raw_dir))?;
    let table = artifact::read(&settings.output_path)?;

    // "n/a" in the raw GDP file and the empty cells never turn into numbers
    assert!(table.row("XX", 2019).is_none());
    assert_eq!(table.value("FR", 2018, "forest_area_percent"), None);
    assert_eq!(table.value("AAA", 2019, "real_gdp_growth_rate"), None);
    Ok(())
}

#[test]
fn test_rerun_overwrites_artifact_identically() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    write_raw(&settings.raw_dir);
    let collector = CountryCollector::new(&settings.raw_dir);

    let first = normalize(&settings, &manifest(), &collector)?;
    let second = normalize(&settings, &manifest(), &collector)?;
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_ne!(first.run_id, second.run_id);
    Ok(())
}

#[test]
fn test_malformed_header_fails_run_before_writing() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    fs::create_dir_all(&settings.raw_dir)?;
    fs::write(
        settings.raw_dir.join("house.csv"),
        "REF_AREA,REF_AREA_LABEL,2020-Q1,2020-Q5\nFR,France,1.1,1.2\n",
    )?;
    let manifest = SourceManifest::new(vec![SourceSpec::annual("house", "house.csv", "house_price_to_income_ratio")
        .with_frequency(Frequency::Quarterly)]);

    let failure = normalize(&settings, &manifest, &CountryCollector::new(&settings.raw_dir)).unwrap_err();
    assert_eq!(failure.stage, RunStage::Reading);
    match failure.error {
        PipelineError::Schema { source_id, column, .. } => {
            assert_eq!(source_id, "house");
            assert_eq!(column, "2020-Q5");
        }
        other => panic!("expected schema error, got {other:?}"),
    }
    assert!(!settings.output_path.exists());
    Ok(())
}

#[test]
fn test_degenerate_scale_fails_before_reading_files() -> Result<()> {
    let temp = tempdir()?;
    let settings = settings(temp.path());
    let manifest = SourceManifest::new(vec![
        SourceSpec::annual("wef", "not-there.csv", "score").with_scale(Scale::Linear { min: 4.0, max: 4.0 }),
    ]);

    let failure = normalize(&settings, &manifest, &CountryCollector::new(&settings.raw_dir)).unwrap_err();
    assert!(matches!(failure.error, PipelineError::Configuration(_)));
    Ok(())
}
