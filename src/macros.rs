/// Build a [`Schema`](crate::Schema) from positional input validators and an
/// optional output validator.
///
/// ```
/// use batchrpc::{schema, Type};
///
/// let multiply = schema!([Type::Int, Type::Int] => Type::Int);
/// assert_eq!(multiply.arity(), Some(2));
/// ```
#[macro_export]
macro_rules! schema {
    ([$($input:expr),* $(,)?] => $output:expr) => {
        $crate::schema!([$($input),*]).output($output)
    };
    ([$($input:expr),* $(,)?]) => {
        $crate::Schema::new().input(::std::vec![
            $(::std::sync::Arc::new($input) as ::std::sync::Arc<dyn $crate::Validator>),*
        ])
    };
}
