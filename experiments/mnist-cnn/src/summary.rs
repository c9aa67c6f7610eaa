use std::{fmt::Write as _, fs, path::Path};

use anyhow::{Context, Result};
use burn::{module::Module, tensor::backend::Backend};

use crate::model::CnnModel;

const WIDTH: usize = 65;
const NAME_COLUMN: usize = 41;

/// Render a layer table with parameter totals.
pub fn render<B: Backend>(model: &CnnModel<B>) -> String {
    let rule = "=".repeat(WIDTH);
    let mut output = String::new();

    let _ = writeln!(&mut output, "{rule}");
    let _ = writeln!(
        &mut output,
        "{:<NAME_COLUMN$}{}",
        "Layer (type (var_name):depth-idx)", "Param #"
    );
    let _ = writeln!(&mut output, "{rule}");
    let _ = writeln!(&mut output, "{:<NAME_COLUMN$}{}", "CnnModel", "--");

    for (index, layer) in model.layers().iter().enumerate() {
        let label = format!("├─{} ({}): 1-{}", layer.kind, layer.name, index + 1);
        let params = if layer.params == 0 {
            "--".to_owned()
        } else {
            group_thousands(layer.params)
        };
        let _ = writeln!(&mut output, "{label:<NAME_COLUMN$}{params}");
    }

    let total = model.num_params();
    let _ = writeln!(&mut output, "{rule}");
    let _ = writeln!(&mut output, "Total params: {}", group_thousands(total));
    let _ = writeln!(&mut output, "Trainable params: {}", group_thousands(total));
    let _ = writeln!(&mut output, "Non-trainable params: 0");
    let _ = writeln!(&mut output, "{rule}");

    output
}

pub fn write<B: Backend>(model: &CnnModel<B>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    fs::write(path, render(model))
        .with_context(|| format!("failed to write model summary to {}", path.display()))
}

fn group_thousands(value: usize) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CnnModelConfig;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    #[test]
    fn groups_digits() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(320), "320");
        assert_eq!(group_thousands(18_496), "18,496");
        assert_eq!(group_thousands(421_642), "421,642");
        assert_eq!(group_thousands(1_000_000), "1,000,000");
    }

    #[test]
    fn lists_layers_and_totals() {
        let model = CnnModelConfig::new().init::<NdArray>(&NdArrayDevice::Cpu);
        let text = render(&model);

        assert!(text.contains("├─Conv2d (conv1): 1-1"));
        assert!(text.contains("├─MaxPool2d (pool): 1-3"));
        assert!(text.contains("├─Linear (fc2): 1-5"));
        assert!(text.contains("Total params: 421,642"));
        assert!(text.contains("Non-trainable params: 0"));
    }

    #[test]
    fn writes_summary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts/model_summary.txt");
        let model = CnnModelConfig::new().init::<NdArray>(&NdArrayDevice::Cpu);

        write(&model, &path).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), render(&model));
    }
}
