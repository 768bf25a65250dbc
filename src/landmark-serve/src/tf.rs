//! TensorFlow backend: frozen GraphDef files and SavedModel directories.

use std::fs;
use std::path::Path;

use log::debug;
use tensorflow::{
    Graph, ImportGraphDefOptions, SavedModelBundle, Session, SessionOptions, SessionRunArgs,
    Status, Tensor,
};

use crate::error::{Error, Result};
use crate::model::{check_input, Model, ModelLoader};
use crate::normalize::InputTensor;

pub const DEFAULT_INPUT_OP: &str = "serving_default_input_1";
pub const DEFAULT_OUTPUT_OP: &str = "StatefulPartitionedCall";

fn inference(status: Status) -> Error {
    Error::Inference(status.to_string())
}

#[derive(Clone, Debug)]
pub struct TfLoader {
    /// Operation fed with the image batch
    pub input_op: String,

    /// Operation fetched for the class scores
    pub output_op: String,
}

impl Default for TfLoader {
    fn default() -> Self {
        TfLoader {
            input_op: DEFAULT_INPUT_OP.to_owned(),
            output_op: DEFAULT_OUTPUT_OP.to_owned(),
        }
    }
}

impl ModelLoader for TfLoader {
    type Model = TfModel;

    fn load(&self, path: &Path) -> Result<TfModel> {
        let mut graph = Graph::new();

        let session = if path.is_dir() {
            debug!("{} is a SavedModel directory", path.display());
            SavedModelBundle::load(&SessionOptions::new(), &["serve"], &mut graph, path)
                .map_err(|e| Error::model_load(path, e))?
                .session
        } else {
            let proto = fs::read(path)?;
            graph
                .import_graph_def(&proto, &ImportGraphDefOptions::new())
                .map_err(|e| Error::model_load(path, e))?;
            Session::new(&SessionOptions::new(), &graph).map_err(|e| Error::model_load(path, e))?
        };

        for op in &[&self.input_op, &self.output_op] {
            graph
                .operation_by_name_required(op)
                .map_err(|e| Error::model_load(path, e))?;
        }

        Ok(TfModel {
            graph,
            session,
            input_op: self.input_op.clone(),
            output_op: self.output_op.clone(),
        })
    }
}

pub struct TfModel {
    graph: Graph,
    session: Session,
    input_op: String,
    output_op: String,
}

impl Model for TfModel {
    fn infer(&self, input: &InputTensor) -> Result<Vec<f32>> {
        check_input(self.input_shape(), input)?;

        let dims: Vec<u64> = input.shape().iter().map(|&d| d as u64).collect();
        let tensor = Tensor::new(&dims)
            .with_values(input.data())
            .map_err(inference)?;

        let mut args = SessionRunArgs::new();

        args.add_feed(
            &self
                .graph
                .operation_by_name_required(&self.input_op)
                .map_err(inference)?,
            0,
            &tensor,
        );

        let result = args.request_fetch(
            &self
                .graph
                .operation_by_name_required(&self.output_op)
                .map_err(inference)?,
            0,
        );

        self.session.run(&mut args).map_err(inference)?;
        let output: Tensor<f32> = args.fetch(result).map_err(inference)?;

        Ok(output.to_vec())
    }
}
