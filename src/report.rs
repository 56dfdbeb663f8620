//! Human readable training reports and loss curve plots

use std::error::Error;

use plotters::{
    chart::{ChartBuilder, SeriesLabelPosition},
    prelude::{BitMapBackend, IntoDrawingArea, PathElement},
    series::LineSeries,
    style::{BLACK, BLUE, Color, RED, WHITE},
};

use crate::train::{EpochRecord, History};

/// One line per epoch, e.g.
/// `Epoch: 3/30.. Training Loss: 0.512.. Test Loss: 0.431.. Test Accuracy: 0.845`
pub fn epoch_summary(record: &EpochRecord, epochs: usize) -> String {
    let mut line = format!(
        "Epoch: {}/{}.. Training Loss: {:.3}..",
        record.epoch, epochs, record.train.loss
    );
    if let Some(validation) = record.validation {
        line.push_str(&format!(
            " Test Loss: {:.3}.. Test Accuracy: {:.3}",
            validation.loss,
            validation.accuracy()
        ));
    }
    line
}

/// Lists the class probabilities of one image, most likely first, with a bar per class
pub fn class_probabilities(probs: &[f32], class_names: &[&str]) -> String {
    let mut ranked = probs.iter().copied().enumerate().collect::<Vec<_>>();
    ranked.sort_by(|(_, a), (_, b)| b.total_cmp(a));
    ranked
        .into_iter()
        .map(|(class, p)| {
            let name = class_names.get(class).copied().unwrap_or("?");
            let bar = "#".repeat((p.clamp(0.0, 1.0) * 40.0).round() as usize);
            format!("{:>12} {:.3} {}", name, p, bar)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plots the training loss (and the validation loss when recorded) against the epoch
pub fn plot_losses(history: &History, file_name: &str) -> Result<(), Box<dyn Error>> {
    let train_losses = history.train_losses();
    let validation_losses = history.validation_losses();
    let max_loss = train_losses
        .iter()
        .chain(validation_losses.iter())
        .copied()
        .filter(|l| l.is_finite())
        .fold(0.0f32, f32::max);
    let n_epochs = train_losses.len().max(2) as f32;

    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Loss per epoch", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(1.0f32..n_epochs, 0.0f32..(max_loss * 1.1).max(1e-3))?;

    chart
        .configure_mesh()
        .x_desc("epoch")
        .y_desc("loss")
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            train_losses
                .iter()
                .enumerate()
                .map(|(i, &l)| ((i + 1) as f32, l)),
            &RED,
        ))?
        .label("Training loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));

    if !validation_losses.is_empty() {
        chart
            .draw_series(LineSeries::new(
                validation_losses
                    .iter()
                    .enumerate()
                    .map(|(i, &l)| ((i + 1) as f32, l)),
                &BLUE,
            ))?
            .label("Validation loss")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Loss plot has been saved to '{}'.", file_name);
    Ok(())
}
