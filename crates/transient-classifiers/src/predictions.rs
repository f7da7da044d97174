use std::fs::File;
use std::path::Path;

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

/// Marker for cells that have not been written yet.
pub const UNFILLED: f64 = -1.0;

/// Class probabilities per object. Columns are the sorted class labels seen
/// during training, rows follow the dataset order.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PredictionTable {
    object_ids: Vec<String>,
    classes: Vec<String>,
    values: Array2<f64>,
}

impl PredictionTable {
    pub fn new(object_ids: Vec<String>, classes: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != object_ids.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: object_ids.len(),
                found: values.nrows(),
            });
        }
        if values.ncols() != classes.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: classes.len(),
                found: values.ncols(),
            });
        }
        Ok(Self {
            object_ids,
            classes,
            values,
        })
    }

    /// A table with every cell set to [`UNFILLED`], ready to be filled fold by fold.
    pub fn unfilled(object_ids: Vec<String>, classes: Vec<String>) -> Self {
        let values = Array2::from_elem((object_ids.len(), classes.len()), UNFILLED);
        Self {
            object_ids,
            classes,
            values,
        }
    }

    fn row_is_unfilled(&self, row: usize) -> bool {
        self.values.row(row).iter().all(|&v| v == UNFILLED)
    }

    /// Write `block` into `rows`. Every target row must still be unfilled.
    pub fn fill_rows(&mut self, rows: &[usize], block: &Array2<f64>) -> Result<()> {
        if block.nrows() != rows.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: rows.len(),
                found: block.nrows(),
            });
        }
        if block.ncols() != self.classes.len() {
            return Err(ClassifierError::LengthMismatch {
                expected: self.classes.len(),
                found: block.ncols(),
            });
        }
        for &row in rows {
            if row >= self.len() || !self.row_is_unfilled(row) {
                return Err(ClassifierError::FoldLeakage { row });
            }
        }
        for (&row, values) in rows.iter().zip(block.axis_iter(Axis(0))) {
            self.values.row_mut(row).assign(&values);
        }
        Ok(())
    }

    /// Fails on the first row still holding an unfilled cell.
    pub fn ensure_complete(&self) -> Result<()> {
        match self
            .values
            .axis_iter(Axis(0))
            .position(|row| row.iter().any(|&v| v == UNFILLED))
        {
            Some(row) => Err(ClassifierError::FoldLeakage { row }),
            None => Ok(()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.ensure_complete().is_ok()
    }

    pub fn len(&self) -> usize {
        self.object_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_ids.is_empty()
    }

    pub fn object_ids(&self) -> &[String] {
        &self.object_ids
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn column(&self, class_name: &str) -> Option<ArrayView1<f64>> {
        self.classes
            .iter()
            .position(|c| c == class_name)
            .map(|i| self.values.column(i))
    }

    pub fn select_rows(&self, rows: &[usize]) -> PredictionTable {
        PredictionTable {
            object_ids: rows.iter().map(|&i| self.object_ids[i].clone()).collect(),
            classes: self.classes.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }

    /// Write the table as CSV with an `object_id` column followed by one
    /// column per class.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = csv::Writer::from_writer(file);

        let mut header = Vec::with_capacity(self.classes.len() + 1);
        header.push("object_id".to_string());
        header.extend(self.classes.iter().cloned());
        writer.write_record(&header)?;

        for (object_id, row) in self.object_ids.iter().zip(self.values.axis_iter(Axis(0))) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(object_id.clone());
            record.extend(row.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        log::debug!("Wrote {} predictions to {:?}", self.len(), path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("obj_{}", i)).collect()
    }

    #[test]
    fn test_fill_rows_once() {
        let mut table = PredictionTable::unfilled(ids(3), vec!["a".into(), "b".into()]);
        assert!(!table.is_complete());

        table.fill_rows(&[0, 2], &array![[0.2, 0.8], [0.6, 0.4]]).unwrap();
        assert!(matches!(
            table.ensure_complete(),
            Err(ClassifierError::FoldLeakage { row: 1 })
        ));

        let err = table.fill_rows(&[2], &array![[0.5, 0.5]]).unwrap_err();
        assert!(matches!(err, ClassifierError::FoldLeakage { row: 2 }));

        table.fill_rows(&[1], &array![[0.5, 0.5]]).unwrap();
        assert!(table.is_complete());
        assert_eq!(table.column("b").unwrap().to_vec(), vec![0.8, 0.5, 0.4]);
        assert!(table.column("c").is_none());
    }

    #[test]
    fn test_write_csv() {
        let table = PredictionTable::new(
            ids(2),
            vec!["a".into(), "b".into()],
            array![[0.25, 0.75], [1.0, 0.0]],
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        table.write_csv(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "object_id,a,b");
        assert_eq!(lines[1], "obj_0,0.25,0.75");
        assert_eq!(lines[2], "obj_1,1,0");
    }
}
