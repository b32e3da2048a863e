//! The current selection and everything derived from it.
//!
//! [`SelectionStore`] is the single source of truth. Subscribers run
//! synchronously, in registration order, on every mutation; there is no
//! debouncing and no change detection. Only the owner mutates the store, so
//! nothing here is locked.

use crate::aggregate::{
    self, AgeGroup, EmploymentData, GenderBreakdown, HouseholdData, HousingData, LiteracyData,
};
use crate::types::Feature;
use std::cell::RefCell;
use std::rc::Rc;

pub type SubscriptionId = u64;

type Subscriber = Box<dyn FnMut(&[Feature])>;

#[derive(Default)]
pub struct SelectionStore {
    features: Vec<Feature>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_id: SubscriptionId,
}

impl SelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Registers `subscriber` and runs it once against the current selection.
    pub fn subscribe<F>(&mut self, mut subscriber: F) -> SubscriptionId
    where
        F: FnMut(&[Feature]) + 'static,
    {
        subscriber(&self.features);
        self.register(Box::new(subscriber))
    }

    fn register(&mut self, subscriber: Subscriber) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, subscriber));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Replaces the selection and notifies every subscriber.
    pub fn set(&mut self, features: Vec<Feature>) {
        self.features = features;
        self.notify();
    }

    pub fn clear(&mut self) {
        self.set(Vec::new());
    }

    /// A value recomputed from the selection on every mutation.
    pub fn derive<T, F>(&mut self, compute: F) -> Derived<T>
    where
        T: 'static,
        F: Fn(&[Feature]) -> T + 'static,
    {
        let value = Rc::new(RefCell::new(compute(&self.features)));
        let slot = Rc::clone(&value);
        let id = self.register(Box::new(move |features: &[Feature]| {
            *slot.borrow_mut() = compute(features);
        }));
        Derived { value, id }
    }

    fn notify(&mut self) {
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber(&self.features);
        }
    }
}

/// Read handle on a derived value.
pub struct Derived<T> {
    value: Rc<RefCell<T>>,
    id: SubscriptionId,
}

impl<T> Derived<T> {
    pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        read(&self.value.borrow())
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.id
    }
}

impl<T: Clone> Derived<T> {
    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }
}

/// Every dashboard statistic, each subscribed to the store on its own.
pub struct Statistics {
    pub total_population: Derived<i64>,
    pub gender: Derived<GenderBreakdown>,
    pub age_groups: Derived<Vec<AgeGroup>>,
    pub employment: Derived<EmploymentData>,
    pub literacy: Derived<LiteracyData>,
    pub housing: Derived<HousingData>,
    pub avg_age: Derived<f64>,
    pub households: Derived<HouseholdData>,
}

impl Statistics {
    pub fn register(store: &mut SelectionStore) -> Self {
        Self {
            total_population: store.derive(aggregate::total_population),
            gender: store.derive(aggregate::gender_breakdown),
            age_groups: store.derive(aggregate::age_groups_data),
            employment: store.derive(aggregate::employment_data),
            literacy: store.derive(aggregate::literacy_data),
            housing: store.derive(aggregate::housing_data),
            avg_age: store.derive(aggregate::avg_age),
            households: store.derive(aggregate::household_data),
        }
    }

    /// Detaches every statistic from `store`.
    pub fn unregister(self, store: &mut SelectionStore) {
        for id in [
            self.total_population.id,
            self.gender.id,
            self.age_groups.id,
            self.employment.id,
            self.literacy.id,
            self.housing.id,
            self.avg_age.id,
            self.households.id,
        ] {
            store.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::cell::Cell;

    fn feature(properties: Value) -> Feature {
        Feature::new(Value::Null, properties.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn subscribers_run_on_every_mutation() {
        let mut store = SelectionStore::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        store.subscribe(move |_| counter.set(counter.get() + 1));
        assert_eq!(calls.get(), 1);

        let same = vec![feature(json!({"n_per": 1}))];
        store.set(same.clone());
        store.set(same);
        store.clear();
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn unsubscribed_callbacks_stop_running() {
        let mut store = SelectionStore::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let id = store.subscribe(move |_| counter.set(counter.get() + 1));
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set(vec![feature(json!({}))]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn statistics_follow_the_selection() {
        let mut store = SelectionStore::new();
        let stats = Statistics::register(&mut store);
        assert_eq!(stats.total_population.get(), 0);
        assert_eq!(stats.gender.get(), GenderBreakdown::default());

        store.set(vec![
            feature(json!({"n_per": 100, "n_hombres": 60, "n_mujeres": 40, "prom_edad": 40})),
            feature(json!({"n_per": 50, "prom_edad": 0})),
        ]);
        assert_eq!(stats.total_population.get(), 150);
        assert_eq!(stats.gender.with(|g| g.male_percent), 60.0);
        assert_eq!(stats.avg_age.get(), 40.0);
        assert_eq!(stats.age_groups.with(|groups| groups.len()), 7);

        store.set(vec![feature(json!({"n_per": 7}))]);
        assert_eq!(stats.total_population.get(), 7);
        assert_eq!(stats.gender.get().total, 0);

        store.clear();
        assert_eq!(stats.total_population.get(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn unregistered_statistics_freeze() {
        let mut store = SelectionStore::new();
        let population = store.derive(aggregate::total_population);
        let other = Statistics::register(&mut store);
        other.unregister(&mut store);
        store.set(vec![feature(json!({"n_per": 3}))]);
        assert_eq!(population.get(), 3);
        assert_eq!(store.subscribers.len(), 1);
    }
}
