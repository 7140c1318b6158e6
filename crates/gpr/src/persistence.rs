//! Save and load a learned GP regressor as four whitespace delimited text files
//! sharing a common prefix:
//!
//! * `<prefix>-RegressionVectors.txt`: (n, output_dim) regression vectors,
//! * `<prefix>-SampleVectors.txt`: (input_dim, n) samples, one sample per column,
//! * `<prefix>-LabelVectors.txt`: (output_dim, n) labels, one label per column,
//! * `<prefix>-ParameterFile.txt`: a single line
//!   `kernel_type n_params param_0 ... param_n-1 sigma input_dim output_dim debug`
//!   with `debug` written as `0` or `1`.
//!
//! Inversion method, stable inversion and efficient storage settings are not
//! persisted: a loaded model keeps the settings of the instance it is loaded into.

use crate::algorithm::GaussianProcessRegressor;
use crate::errors::{GprError, Result};
use crate::kernels::{kernel_from_parameters, Kernel};
use crate::utils::{read_matrix, write_matrix};

use linfa::Float;
use ndarray::{Array1, Array2};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

const REGRESSION_VECTORS_SUFFIX: &str = "RegressionVectors";
const SAMPLE_VECTORS_SUFFIX: &str = "SampleVectors";
const LABEL_VECTORS_SUFFIX: &str = "LabelVectors";
const PARAMETER_FILE_SUFFIX: &str = "ParameterFile";

fn artifact_path(prefix: &str, suffix: &str) -> String {
    format!("{prefix}-{suffix}.txt")
}

/// Content of the parameter file
#[derive(Debug)]
struct ParameterLine<F> {
    kernel_type: String,
    kernel_params: Vec<F>,
    sigma: F,
    input_dim: usize,
    output_dim: usize,
    debug: bool,
}

impl<F: Float + FromStr> FromStr for ParameterLine<F> {
    type Err = GprError;

    fn from_str(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let mut next = |what: &str| {
            tokens
                .next()
                .ok_or_else(|| GprError::CorruptState(format!("parameter file: missing {what}")))
        };
        fn parse<T: FromStr>(tok: &str, what: &str) -> Result<T> {
            tok.parse::<T>().map_err(|_| {
                GprError::CorruptState(format!("parameter file: bad {what} '{tok}'"))
            })
        }

        let kernel_type = next("kernel type")?.to_string();
        let n_params: usize = parse(next("number of kernel parameters")?, "number of parameters")?;
        let mut kernel_params = Vec::new();
        for i in 0..n_params {
            kernel_params.push(parse(next("kernel parameter")?, &format!("kernel parameter {i}"))?);
        }
        let sigma = parse(next("sigma")?, "sigma")?;
        let input_dim = parse(next("input dimension")?, "input dimension")?;
        let output_dim = parse(next("output dimension")?, "output dimension")?;
        let debug = match next("debug flag")? {
            "0" => false,
            "1" => true,
            tok => {
                return Err(GprError::CorruptState(format!(
                    "parameter file: bad debug flag '{tok}'"
                )))
            }
        };
        if let Some(tok) = tokens.next() {
            return Err(GprError::CorruptState(format!(
                "parameter file: unexpected trailing token '{tok}'"
            )));
        }
        Ok(ParameterLine {
            kernel_type,
            kernel_params,
            sigma,
            input_dim,
            output_dim,
            debug,
        })
    }
}

/// Fully read and validated model, ready to be committed
struct LoadedModel<F: Float> {
    kernel: Arc<dyn Kernel<F>>,
    sigma: F,
    samples: Vec<Array1<F>>,
    labels: Vec<Array1<F>>,
    regression_vectors: Array2<F>,
    input_dim: usize,
    output_dim: usize,
    debug: bool,
}

fn existing_artifact(prefix: &str, suffix: &str) -> Result<String> {
    let path = artifact_path(prefix, suffix);
    if !Path::new(&path).is_file() {
        return Err(GprError::MissingArtifact(format!(
            "{path} does not exist or is not a regular file"
        )));
    }
    Ok(path)
}

fn read_model<F: Float + FromStr>(prefix: &str) -> Result<LoadedModel<F>> {
    let rv_path = existing_artifact(prefix, REGRESSION_VECTORS_SUFFIX)?;
    let samples_path = existing_artifact(prefix, SAMPLE_VECTORS_SUFFIX)?;
    let labels_path = existing_artifact(prefix, LABEL_VECTORS_SUFFIX)?;
    let params_path = existing_artifact(prefix, PARAMETER_FILE_SUFFIX)?;

    let regression_vectors: Array2<F> = read_matrix(&rv_path)?;
    let samples: Array2<F> = read_matrix(&samples_path)?;
    let labels: Array2<F> = read_matrix(&labels_path)?;
    let params: ParameterLine<F> = std::fs::read_to_string(&params_path)?.parse()?;

    let n = regression_vectors.nrows();
    if n == 0 {
        return Err(GprError::CorruptState(format!(
            "{rv_path}: no regression vectors"
        )));
    }
    let expected = [
        (&rv_path, regression_vectors.dim(), (n, params.output_dim)),
        (&samples_path, samples.dim(), (params.input_dim, n)),
        (&labels_path, labels.dim(), (params.output_dim, n)),
    ];
    for (path, actual, expected) in expected {
        if actual != expected {
            return Err(GprError::CorruptState(format!(
                "{path}: shape {actual:?} does not match expected shape {expected:?}"
            )));
        }
    }

    let kernel = kernel_from_parameters(&params.kernel_type, &params.kernel_params)?;
    Ok(LoadedModel {
        kernel,
        sigma: params.sigma,
        samples: samples.columns().into_iter().map(|c| c.to_owned()).collect(),
        labels: labels.columns().into_iter().map(|c| c.to_owned()).collect(),
        regression_vectors,
        input_dim: params.input_dim,
        output_dim: params.output_dim,
        debug: params.debug,
    })
}

impl<F: Float> GaussianProcessRegressor<F> {
    /// Save the learned model under the given path prefix.
    ///
    /// Fails with [`GprError::InvalidState`] if the model is not initialized.
    pub fn save(&self, prefix: &str) -> Result<()> {
        if !self.is_initialized() {
            return Err(GprError::InvalidState(
                "save: gaussian process is not initialized".to_string(),
            ));
        }
        self.log_step(format!("save: writing model to {prefix}-*.txt"));

        let n = self.n_samples();
        let samples = Array2::from_shape_fn((self.input_dim(), n), |(i, j)| self.samples()[j][i]);
        let labels = Array2::from_shape_fn((self.output_dim(), n), |(i, j)| self.labels()[j][i]);
        write_matrix(
            self.regression_vectors(),
            artifact_path(prefix, REGRESSION_VECTORS_SUFFIX),
        )?;
        write_matrix(&samples, artifact_path(prefix, SAMPLE_VECTORS_SUFFIX))?;
        write_matrix(&labels, artifact_path(prefix, LABEL_VECTORS_SUFFIX))?;

        let kernel_params = self.kernel().parameters();
        let mut tokens = vec![self.kernel().to_string(), kernel_params.len().to_string()];
        tokens.extend(kernel_params.iter().map(|p| p.to_string()));
        tokens.push(self.sigma().to_string());
        tokens.push(self.input_dim().to_string());
        tokens.push(self.output_dim().to_string());
        tokens.push(u8::from(self.debug()).to_string());

        let file = File::create(artifact_path(prefix, PARAMETER_FILE_SUFFIX))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", tokens.join(" "))?;
        writer.flush()?;
        Ok(())
    }
}

impl<F: Float + FromStr> GaussianProcessRegressor<F> {
    /// Replace the whole model state by the model saved under the given path prefix.
    ///
    /// All files are read and validated before any change: on failure the
    /// engine is left unchanged. On success the engine is initialized without
    /// retained core matrix.
    pub fn load(&mut self, prefix: &str) -> Result<()> {
        let model = read_model(prefix)?;
        self.replace_state(
            model.kernel,
            model.sigma,
            model.samples,
            model.labels,
            model.regression_vectors,
            model.input_dim,
            model.output_dim,
            model.debug,
        );
        self.log_step(format!(
            "load: {} samples loaded from {prefix}-*.txt",
            self.n_samples()
        ));
        Ok(())
    }

    /// Build a GP regressor from the model saved under the given path prefix,
    /// with default inversion settings.
    pub fn load_from(prefix: &str) -> Result<Self> {
        let model = read_model(prefix)?;
        let mut gp = GaussianProcessRegressor::new(model.kernel.clone());
        gp.replace_state(
            model.kernel,
            model.sigma,
            model.samples,
            model.labels,
            model.regression_vectors,
            model.input_dim,
            model.output_dim,
            model.debug,
        );
        Ok(gp)
    }
}
