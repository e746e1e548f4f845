use crate::{
    callback::{report, DetectorCallback, MessageLevel},
    decoder::ImageDecoder,
    error::DetectorError,
    model_service::DetectionModel,
    results::{DetectionResult, ResultSet},
    runset::{LabelableItem, RunSetIterator},
    stop_signal::StopSignal,
};

/// Walks the run set once, checking the stop signal between items, and
/// delivers the accumulated results to the callback exactly once.
pub fn run(
    items: &mut RunSetIterator,
    model: &dyn DetectionModel,
    decoder: &dyn ImageDecoder,
    stop: &StopSignal,
    callback: &dyn DetectorCallback,
) -> ResultSet {
    let mut results = ResultSet::default();

    loop {
        if stop.is_requested() {
            stop.complete();
            results.cancelled = true;
            report(
                callback,
                MessageLevel::Info,
                &format!("Job cancelled after {} items", results.len()),
            );
            break;
        }

        let Some(item) = items.get_next() else {
            break;
        };
        results.push(process_item(item, model, decoder, callback));
    }

    tracing::info!(
        "Job finished: {} results, {} positive, {} problems",
        results.len(),
        results.positives(),
        results.problems()
    );
    callback.found_new_results(&results);

    // A request that arrived after the last check is acknowledged here.
    stop.complete();

    results
}

fn process_item(
    item: LabelableItem,
    model: &dyn DetectionModel,
    decoder: &dyn ImageDecoder,
    callback: &dyn DetectorCallback,
) -> DetectionResult {
    let Some(image) = decoder.decode(&item.path) else {
        let diagnostic = DetectorError::PerItemDecodeFailure(item.path.clone()).to_string();
        report(callback, MessageLevel::Warn, &diagnostic);
        return DetectionResult::problem(item, diagnostic);
    };

    match model.detect(&image) {
        Ok(candidates) => {
            tracing::debug!("{:?}: {} candidates", item.path, candidates.len());
            DetectionResult::from_candidates(item, candidates)
        }
        Err(e) => {
            let diagnostic = format!("{:?}: {}", item.path, e);
            report(callback, MessageLevel::Warn, &diagnostic);
            DetectionResult::problem(item, diagnostic)
        }
    }
}
