use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

pub mod conditions {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
    pub trait Conditions {
        fn conditions(&self) -> &Option<Vec<Condition>>;
        fn conditions_mut(&mut self) -> &mut Option<Vec<Condition>>;
    }
}

#[derive(Default, operator_derive::Conditions)]
pub struct AdcStatusFixture {
    pub conditions: Option<Vec<Condition>>,
    pub observed_generation: Option<i64>,
}

fn main() {
    use conditions::Conditions;
    let mut status = AdcStatusFixture::default();
    assert!(status.conditions().is_none());
    *status.conditions_mut() = Some(Vec::new());
    assert!(status.conditions().as_ref().is_some_and(|c| c.is_empty()));
    assert!(status.observed_generation.is_none());
}
