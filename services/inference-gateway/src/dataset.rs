//! Bundled demo dataset (Iris, 150 rows, three balanced classes).

use crate::engine::{IRIS_CLASSES, N_FEATURES};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;

const IRIS_CSV: &str = include_str!("../data/iris.csv");

#[derive(Debug, Deserialize)]
struct IrisRow {
    sepal_length: f64,
    sepal_width: f64,
    petal_length: f64,
    petal_width: f64,
    species: String,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub features: Vec<[f64; N_FEATURES]>,
    pub labels: Vec<usize>,
    pub classes: Vec<String>,
}

impl Dataset {
    pub fn len(&self) -> usize { self.labels.len() }
    pub fn is_empty(&self) -> bool { self.labels.is_empty() }

    fn subset(&self, idx: &[usize]) -> Self {
        Self {
            features: idx.iter().map(|&i| self.features[i]).collect(),
            labels: idx.iter().map(|&i| self.labels[i]).collect(),
            classes: self.classes.clone(),
        }
    }

    /// Per-class shuffled split so both halves keep the class balance.
    /// Returns `(train, test)`.
    pub fn stratified_split(&self, test_size: f64, seed: u64) -> (Self, Self) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut train, mut test) = (Vec::new(), Vec::new());
        for class in 0..self.classes.len() {
            let mut idx: Vec<usize> = (0..self.len()).filter(|&i| self.labels[i] == class).collect();
            idx.shuffle(&mut rng);
            let n_test = ((idx.len() as f64) * test_size).round() as usize;
            test.extend_from_slice(&idx[..n_test.min(idx.len())]);
            train.extend_from_slice(&idx[n_test.min(idx.len())..]);
        }
        train.shuffle(&mut rng);
        (self.subset(&train), self.subset(&test))
    }
}

pub fn iris() -> Result<Dataset, csv::Error> {
    let classes: Vec<String> = IRIS_CLASSES.iter().map(|s| s.to_string()).collect();
    let mut ds = Dataset { classes, ..Default::default() };
    for row in csv::Reader::from_reader(IRIS_CSV.as_bytes()).deserialize() {
        let row: IrisRow = row?;
        let Some(label) = ds.classes.iter().position(|c| *c == row.species) else { continue };
        ds.features.push([row.sepal_length, row.sepal_width, row.petal_length, row.petal_width]);
        ds.labels.push(label);
    }
    Ok(ds)
}
