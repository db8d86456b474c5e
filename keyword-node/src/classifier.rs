/// Classifier interface
///
/// The inference engine is an injected collaborator with a fixed
/// int8-in/int8-out contract. `ClassifierSession` owns the tensor arena,
/// sized once from the model settings, and checks the collaborator's shape
/// and schema before the node starts.

use crate::config::ModelSettings;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Tensor layout version this node was built against
pub const SCHEMA_VERSION: u32 = 3;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Classifier schema version {found} not supported (expected {expected})")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("Classifier {tensor} shape mismatch: got {got} elements, want {want}")]
    ShapeMismatch {
        tensor: &'static str,
        got: usize,
        want: usize,
    },

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Opaque `scores = infer(features)` service
pub trait Classifier: Send {
    fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }

    /// Expected input elements (`N * bins`)
    fn input_len(&self) -> usize;

    /// Produced scores (one per category)
    fn output_len(&self) -> usize;

    fn infer(&mut self, input: &[i8], output: &mut [i8]) -> Result<(), ClassifierError>;
}

/// Classifier plus its fixed input/output arena
pub struct ClassifierSession {
    classifier: Box<dyn Classifier>,
    input: Vec<i8>,
    output: Vec<i8>,
    invocations: u64,
}

impl ClassifierSession {
    /// Fails when the collaborator does not match the model shape
    pub fn new(classifier: Box<dyn Classifier>, settings: &ModelSettings) -> Result<Self, ClassifierError> {
        let found = classifier.schema_version();
        if found != SCHEMA_VERSION {
            return Err(ClassifierError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found,
            });
        }

        let want_input = settings.feature_element_count();
        if classifier.input_len() != want_input {
            return Err(ClassifierError::ShapeMismatch {
                tensor: "input",
                got: classifier.input_len(),
                want: want_input,
            });
        }

        let want_output = settings.category_count();
        if classifier.output_len() != want_output {
            return Err(ClassifierError::ShapeMismatch {
                tensor: "output",
                got: classifier.output_len(),
                want: want_output,
            });
        }

        info!(
            "Classifier ready: {} inputs, {} categories (schema v{})",
            want_input, want_output, found
        );

        Ok(Self {
            classifier,
            input: vec![0; want_input],
            output: vec![0; want_output],
            invocations: 0,
        })
    }

    /// Copy the feature window into the arena and run inference
    pub fn invoke(&mut self, features: &[i8]) -> Result<&[i8], ClassifierError> {
        if features.len() != self.input.len() {
            return Err(ClassifierError::ShapeMismatch {
                tensor: "input",
                got: features.len(),
                want: self.input.len(),
            });
        }

        self.input.copy_from_slice(features);
        self.classifier.infer(&self.input, &mut self.output)?;
        self.invocations += 1;

        trace!("Scores: {:?}", self.output);

        Ok(&self.output)
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }
}

/// Classifier that always reports the null category
///
/// Lets the pipeline run end to end on hardware without a bundled model.
pub struct NullClassifier {
    input_len: usize,
    output_len: usize,
    null_index: usize,
}

impl NullClassifier {
    pub fn new(settings: &ModelSettings) -> Self {
        let null_index = (0..settings.category_count())
            .find(|&i| settings.is_null_category(i))
            .unwrap_or(0);

        debug!("Null classifier answering category {}", null_index);

        Self {
            input_len: settings.feature_element_count(),
            output_len: settings.category_count(),
            null_index,
        }
    }
}

impl Classifier for NullClassifier {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn infer(&mut self, _input: &[i8], output: &mut [i8]) -> Result<(), ClassifierError> {
        output.fill(i8::MIN);
        if let Some(slot) = output.get_mut(self.null_index) {
            *slot = i8::MAX;
        }
        Ok(())
    }
}
